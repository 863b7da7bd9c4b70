//! Mock upstream transport for exercising the relay core without a socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::classify::{classify, ClassifiedFailure, UpstreamFailure};
use super::client::{ConnectParams, UpstreamClient, UpstreamTransport};
use super::events::UpstreamEvent;

/// In-memory [`UpstreamClient`] that records everything written to it.
pub(crate) struct TestClient {
    attempt_id: String,
    open: AtomicBool,
    fail_sends: AtomicBool,
    audio: Mutex<Vec<Bytes>>,
    control: Mutex<Vec<String>>,
}

impl TestClient {
    fn new(attempt: usize) -> Self {
        Self {
            attempt_id: format!("mock-{attempt}"),
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            audio: Mutex::new(Vec::new()),
            control: Mutex::new(Vec::new()),
        }
    }

    /// Makes every subsequent send fail.
    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Marks the connection as no longer open.
    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Audio chunks written so far.
    pub(crate) fn audio_chunks(&self) -> Vec<Bytes> {
        self.audio.lock().clone()
    }

    /// Control frames written so far.
    pub(crate) fn control_frames(&self) -> Vec<String> {
        self.control.lock().clone()
    }

    pub(crate) fn was_closed(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClient for TestClient {
    async fn send_audio(&self, chunk: Bytes) -> Result<(), UpstreamFailure> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(UpstreamFailure::message("socket hang up"));
        }
        self.audio.lock().push(chunk);
        Ok(())
    }

    async fn send_control(&self, frame: &str) -> Result<(), UpstreamFailure> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(UpstreamFailure::message("socket hang up"));
        }
        self.control.lock().push(frame.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn attempt_id(&self) -> &str {
        &self.attempt_id
    }
}

/// Scripted [`UpstreamTransport`] handing out [`TestClient`]s and keeping
/// each connection's event sender so tests can inject provider events.
pub(crate) struct MockTransport {
    connects: AtomicUsize,
    fail_remaining: AtomicUsize,
    clients: Mutex<Vec<Arc<TestClient>>>,
    senders: Mutex<Vec<mpsc::Sender<UpstreamEvent>>>,
}

impl MockTransport {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            fail_remaining: AtomicUsize::new(0),
            clients: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        })
    }

    /// Makes the next `count` connect calls fail with a retryable failure.
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of connect calls observed (successful or not).
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The client handed out by the nth successful connect.
    pub(crate) fn client(&self, index: usize) -> Arc<TestClient> {
        self.clients.lock()[index].clone()
    }

    /// The event sender of the nth successful connect.
    pub(crate) fn events(&self, index: usize) -> mpsc::Sender<UpstreamEvent> {
        self.senders.lock()[index].clone()
    }
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn connect(
        &self,
        _params: &ConnectParams,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<Arc<dyn UpstreamClient>, ClassifiedFailure> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(classify(&UpstreamFailure::message(
                "upstream connect timeout",
            )));
        }

        let client = Arc::new(TestClient::new(attempt));
        let _ = events.send(UpstreamEvent::Open).await;
        self.clients.lock().push(Arc::clone(&client));
        self.senders.lock().push(events);
        Ok(client)
    }
}
