//! Upstream transport seam and its WebSocket implementation.
//!
//! The connector and orchestrator depend on the [`UpstreamClient`] and
//! [`UpstreamTransport`] traits rather than on a concrete socket, so the
//! relay core can be exercised against a mock provider in tests and
//! against a Deepgram-compatible endpoint in production.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::classify::{classify, ClassifiedFailure, UpstreamFailure};
use super::events::{parse_provider_message, UpstreamEvent};

/// Bound on the upstream connection attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the per-session event channel between the socket reader
/// and the dispatch task.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Parameters for one upstream connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Provider endpoint URL (without query parameters).
    pub endpoint: String,
    /// Provider API key.
    pub api_key: String,
    /// PCM sampling rate in Hz.
    pub sample_rate: u32,
    /// Language tag.
    pub language: String,
    /// Model identifier.
    pub model: String,
}

/// Handle to one open upstream streaming connection.
///
/// Send failures are reported as raw [`UpstreamFailure`]s so the caller
/// can classify them; `close` is best-effort and never fails.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Writes one PCM chunk to the provider.
    async fn send_audio(&self, chunk: Bytes) -> Result<(), UpstreamFailure>;

    /// Writes one JSON control frame (keepalive, terminator) to the provider.
    async fn send_control(&self, frame: &str) -> Result<(), UpstreamFailure>;

    /// Whether the connection still reports open.
    fn is_open(&self) -> bool;

    /// Closes the connection, swallowing errors.
    async fn close(&self);

    /// Short id identifying this connection attempt in logs.
    fn attempt_id(&self) -> &str;
}

/// Dials the upstream provider and hands back an open client.
///
/// The transport forwards every semantic event of the connection into the
/// provided channel, starting with [`UpstreamEvent::Open`], until the
/// connection dies.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Establishes one streaming connection.
    async fn connect(
        &self,
        params: &ConnectParams,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<Arc<dyn UpstreamClient>, ClassifiedFailure>;
}

/// Production transport speaking the provider's WebSocket protocol.
pub struct WsUpstreamTransport;

impl WsUpstreamTransport {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for WsUpstreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamTransport for WsUpstreamTransport {
    async fn connect(
        &self,
        params: &ConnectParams,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<Arc<dyn UpstreamClient>, ClassifiedFailure> {
        let url = format!(
            "{}?encoding=linear16&sample_rate={}&channels=1&model={}&language={}&punctuate=true&interim_results=true",
            params.endpoint, params.sample_rate, params.model, params.language
        );

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| classify(&UpstreamFailure::message(format!("invalid upstream url: {e}"))))?;
        let auth = HeaderValue::from_str(&format!("Token {}", params.api_key)).map_err(|e| {
            classify(&UpstreamFailure::message(format!(
                "invalid authorization header: {e}"
            )))
        })?;
        request.headers_mut().insert("Authorization", auth);

        let (ws_stream, _response) = match timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(classify(&failure_from_ws_error(&e))),
            Err(_) => {
                return Err(classify(&UpstreamFailure::message(
                    "upstream connect timeout",
                )))
            }
        };

        let attempt_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        log::debug!("[Upstream] socket open (attempt {attempt_id})");

        let (write, mut read) = ws_stream.split();
        let open = Arc::new(AtomicBool::new(true));

        // The open event precedes anything the reader produces.
        let _ = events.send(UpstreamEvent::Open).await;

        let open_for_reader = Arc::clone(&open);
        let events_for_reader = events.clone();
        let reader_attempt = attempt_id.clone();
        let reader = tokio::spawn(async move {
            let mut close_delivered = false;
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_provider_message(&text) {
                            if events_for_reader.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        open_for_reader.store(false, Ordering::SeqCst);
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = events_for_reader
                            .send(UpstreamEvent::Close { code, reason })
                            .await;
                        close_delivered = true;
                        break;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Ok(other) => {
                        log::debug!("[Upstream] unexpected frame: {other:?}");
                    }
                    Err(e) => {
                        open_for_reader.store(false, Ordering::SeqCst);
                        let _ = events_for_reader
                            .send(UpstreamEvent::Error(failure_from_ws_error(&e)))
                            .await;
                        break;
                    }
                }
            }
            if !close_delivered {
                open_for_reader.store(false, Ordering::SeqCst);
                let _ = events_for_reader
                    .send(UpstreamEvent::Close {
                        code: 1006,
                        reason: "upstream stream ended".to_string(),
                    })
                    .await;
            }
            log::debug!("[Upstream] reader ended (attempt {reader_attempt})");
        });

        Ok(Arc::new(WsUpstreamClient {
            write: tokio::sync::Mutex::new(write),
            open,
            reader: Mutex::new(Some(reader)),
            attempt_id,
        }))
    }
}

/// WebSocket-backed [`UpstreamClient`].
struct WsUpstreamClient {
    write: tokio::sync::Mutex<WsSink>,
    open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    attempt_id: String,
}

#[async_trait]
impl UpstreamClient for WsUpstreamClient {
    async fn send_audio(&self, chunk: Bytes) -> Result<(), UpstreamFailure> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(chunk.to_vec()))
            .await
            .map_err(|e| failure_from_ws_error(&e))
    }

    async fn send_control(&self, frame: &str) -> Result<(), UpstreamFailure> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| failure_from_ws_error(&e))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        {
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
        }
        // A deliberate close must not surface as a close event; the reader
        // is stopped before the peer's close reply can be dispatched.
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        log::debug!("[Upstream] socket closed (attempt {})", self.attempt_id);
    }

    fn attempt_id(&self) -> &str {
        &self.attempt_id
    }
}

/// Maps a tungstenite error to a raw failure, preserving an HTTP status
/// when the handshake was rejected.
fn failure_from_ws_error(error: &WsError) -> UpstreamFailure {
    match error {
        WsError::Http(response) => UpstreamFailure::with_status(
            response.status().as_u16(),
            format!("HTTP {} during upstream handshake", response.status().as_u16()),
        ),
        other => UpstreamFailure::message(other.to_string()),
    }
}
