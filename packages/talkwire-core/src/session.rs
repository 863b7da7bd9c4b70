//! Per-session state for one upstream transcription stream.
//!
//! A [`Session`] owns everything attached to one user's STT turn-taking:
//! the upstream client handle, the transcript accumulator, the keepalive
//! ticker, the finalization timer, and the bounded reconnection buffer.
//! Ownership is exclusive: no session references another session or the
//! registry, and `cleanup` releases every owned resource exactly once.
//!
//! Interior mutability follows the usual split: atomics for flags and
//! counters, short `parking_lot::Mutex` sections for compound state. No
//! lock is ever held across an await point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::upstream::client::UpstreamClient;
use crate::utils::now_millis;

/// Upper bound on the total bytes held in a session's reconnection buffer.
pub const MAX_RECONNECT_BUFFER_BYTES: usize = 32 * 1024;

/// State of the session's upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// A connect attempt is in flight.
    Connecting,
    /// The upstream handle is open and streaming.
    Connected,
    /// No upstream handle; reconnection may be pending.
    Disconnected,
    /// A fatal upstream failure stopped the stream.
    Error,
}

/// How the most recent finalization resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationMethod {
    /// The provider acknowledged end-of-stream.
    Event,
    /// The acknowledgement wait timed out (or was cut short by a close).
    Timeout,
    /// No upstream handle existed; nothing was awaited.
    None,
}

/// One transcript fragment as delivered by the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    /// Fragment text.
    pub text: String,
    /// Provider confidence in `[0, 1]`.
    pub confidence: f64,
    /// Arrival timestamp (Unix millis).
    pub timestamp: u64,
    /// Whether the fragment is final.
    pub is_final: bool,
}

/// Transcript state for the current recording turn.
///
/// `accumulated` holds final segments joined by single spaces (with a
/// trailing space until trimmed); `interim` holds the latest non-final
/// fragment and is replaced wholesale on each interim.
#[derive(Debug, Default)]
struct TranscriptAccumulator {
    segments: Vec<TranscriptSegment>,
    accumulated: String,
    interim: String,
}

/// FIFO of audio chunks received while the upstream connection is down.
#[derive(Debug, Default)]
struct ReconnectionBuffer {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
}

/// Signal delivered to an in-flight finalization waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FinalizeSignal {
    /// The provider acknowledged end-of-stream.
    Metadata,
    /// The connection closed before the acknowledgement arrived.
    ConnectionClosed,
}

/// Outcome of a completed finalization round, shared with callers that
/// joined the round instead of starting their own.
#[derive(Debug, Clone)]
pub(crate) struct FinalizeOutcome {
    pub(crate) transcript: String,
    pub(crate) method: FinalizationMethod,
}

/// Waiter and shared-outcome channels for the finalization protocol.
#[derive(Default)]
struct FinalizeChannels {
    waiter: Option<oneshot::Sender<FinalizeSignal>>,
    outcome_rx: Option<watch::Receiver<Option<FinalizeOutcome>>>,
}

/// A cancellable background ticker (keepalive, cleanup sweep).
pub(crate) struct TickerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TickerHandle {
    pub(crate) fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    /// Stops the ticker. Safe to call from sync contexts.
    pub(crate) fn cancel(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Per-session counters. All relaxed; readers may see slightly stale sums.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Audio chunks accepted from the caller.
    pub chunks_received: AtomicU64,
    /// Audio chunks successfully written upstream.
    pub chunks_forwarded: AtomicU64,
    /// Transcript fragments applied to the accumulator.
    pub transcripts_received: AtomicU64,
    /// Per-chunk send failures plus suppressed handler failures.
    pub errors: AtomicU64,
    /// Reconnection rounds started.
    pub reconnections: AtomicU64,
    /// Reconnection rounds that re-established the stream.
    pub successful_reconnections: AtomicU64,
    /// Reconnection rounds that exhausted their attempts.
    pub failed_reconnections: AtomicU64,
    /// Total time spent disconnected during successful reconnections.
    pub total_downtime_ms: AtomicU64,
    /// Chunks diverted into the reconnection buffer.
    pub buffered_chunks_during_reconnection: AtomicU64,
}

/// Serialized per-session metrics view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetricsSnapshot {
    pub session_id: String,
    pub connection_id: String,
    pub connection_state: ConnectionState,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub last_transcript_ms: u64,
    pub duration_ms: u64,
    pub chunks_received: u64,
    pub chunks_forwarded: u64,
    pub transcripts_received: u64,
    pub errors: u64,
    pub reconnections: u64,
    pub successful_reconnections: u64,
    pub failed_reconnections: u64,
    pub total_downtime_ms: u64,
    pub buffered_chunks_during_reconnection: u64,
    pub is_reconnecting: bool,
    pub buffered_bytes: usize,
    pub finalization_method: Option<FinalizationMethod>,
}

/// The per-user, per-call unit of STT work.
pub struct Session {
    /// Opaque session identifier, provided by the owning gateway.
    pub session_id: String,
    /// Caller-scoped connection identifier.
    pub connection_id: String,
    /// Creation timestamp (Unix millis).
    pub created_at_ms: u64,
    /// Resolved configuration for this session.
    pub config: SessionConfig,
    /// Per-session counters.
    pub metrics: SessionMetrics,

    last_activity_ms: AtomicU64,
    last_transcript_ms: AtomicU64,

    client: Mutex<Option<Arc<dyn UpstreamClient>>>,
    connection_state: Mutex<ConnectionState>,

    transcript: Mutex<TranscriptAccumulator>,

    is_finalizing: AtomicBool,
    finalization_timer: Mutex<Option<JoinHandle<()>>>,
    finalize: Mutex<FinalizeChannels>,
    finalization_method: Mutex<Option<FinalizationMethod>>,

    keepalive: Mutex<Option<TickerHandle>>,
    pump: Mutex<Option<JoinHandle<()>>>,

    is_reconnecting: AtomicBool,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    buffer: Mutex<ReconnectionBuffer>,

    is_active: AtomicBool,
}

impl Session {
    /// Creates a new active session with no upstream handle yet.
    #[must_use]
    pub fn new(session_id: String, connection_id: String, config: SessionConfig) -> Self {
        let now = now_millis();
        Self {
            session_id,
            connection_id,
            created_at_ms: now,
            config,
            metrics: SessionMetrics::default(),
            last_activity_ms: AtomicU64::new(now),
            last_transcript_ms: AtomicU64::new(0),
            client: Mutex::new(None),
            connection_state: Mutex::new(ConnectionState::Connecting),
            transcript: Mutex::new(TranscriptAccumulator::default()),
            is_finalizing: AtomicBool::new(false),
            finalization_timer: Mutex::new(None),
            finalize: Mutex::new(FinalizeChannels::default()),
            finalization_method: Mutex::new(None),
            keepalive: Mutex::new(None),
            pump: Mutex::new(None),
            is_reconnecting: AtomicBool::new(false),
            reconnect_task: Mutex::new(None),
            buffer: Mutex::new(ReconnectionBuffer::default()),
            is_active: AtomicBool::new(true),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Activity and liveness
    // ─────────────────────────────────────────────────────────────────────────

    /// Records caller activity for the idle sweep.
    pub fn touch(&self) {
        self.last_activity_ms.store(now_millis(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Backdates the activity clock so sweep behavior can be exercised
    /// without waiting out real wall-clock time.
    #[cfg(test)]
    pub(crate) fn set_last_activity_ms(&self, value: u64) {
        self.last_activity_ms.store(value, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_transcript_ms(&self) -> u64 {
        self.last_transcript_ms.load(Ordering::Relaxed)
    }

    /// Milliseconds since the session was created.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        now_millis().saturating_sub(self.created_at_ms)
    }

    /// False once `cleanup` has run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream handle and connection state
    // ─────────────────────────────────────────────────────────────────────────

    /// Current upstream client handle, if any.
    #[must_use]
    pub fn client(&self) -> Option<Arc<dyn UpstreamClient>> {
        self.client.lock().clone()
    }

    /// Installs a freshly opened upstream handle.
    ///
    /// The previous handle, if one is still present, must already have been
    /// closed by the close handler; it is closed again best-effort so the
    /// at-most-one-open-handle invariant holds regardless.
    pub(crate) fn install_client(&self, client: Arc<dyn UpstreamClient>) {
        let previous = self.client.lock().replace(client);
        if let Some(previous) = previous {
            tokio::spawn(async move { previous.close().await });
        }
    }

    /// Removes and returns the upstream handle.
    pub(crate) fn take_client(&self) -> Option<Arc<dyn UpstreamClient>> {
        self.client.lock().take()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        *self.connection_state.lock() = state;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transcript accumulator
    // ─────────────────────────────────────────────────────────────────────────

    /// Applies one transcript fragment.
    ///
    /// Final fragments append to the accumulated string (space-separated);
    /// interim fragments replace the previous interim wholesale. Both push
    /// a segment record and update the transcript metrics.
    pub fn add_transcript(&self, text: &str, confidence: f64, is_final: bool) {
        let now = now_millis();
        {
            let mut transcript = self.transcript.lock();
            if is_final {
                transcript.accumulated.push_str(text);
                transcript.accumulated.push(' ');
                transcript.interim.clear();
            } else {
                transcript.interim.clear();
                transcript.interim.push_str(text);
            }
            transcript.segments.push(TranscriptSegment {
                text: text.to_string(),
                confidence,
                timestamp: now,
                is_final,
            });
        }
        self.metrics.transcripts_received.fetch_add(1, Ordering::Relaxed);
        self.last_transcript_ms.store(now, Ordering::Relaxed);
    }

    /// Returns the authoritative transcript for the current turn.
    ///
    /// Final segments win; the latest interim fragment is the fallback when
    /// no final segment has arrived. Never both.
    #[must_use]
    pub fn get_final_transcript(&self) -> String {
        let transcript = self.transcript.lock();
        let finalized = transcript.accumulated.trim();
        if finalized.is_empty() {
            transcript.interim.trim().to_string()
        } else {
            finalized.to_string()
        }
    }

    /// Clears accumulated, interim, and segment records. Metrics are untouched.
    pub fn reset_accumulator(&self) {
        let mut transcript = self.transcript.lock();
        transcript.accumulated.clear();
        transcript.interim.clear();
        transcript.segments.clear();
    }

    /// Number of segment records held (final and interim).
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.transcript.lock().segments.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconnection buffer
    // ─────────────────────────────────────────────────────────────────────────

    /// True while a reconnection round is in flight.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting.load(Ordering::SeqCst)
    }

    /// Claims the reconnecting flag. Returns false if a round is already
    /// in flight.
    pub(crate) fn begin_reconnecting(&self) -> bool {
        !self.is_reconnecting.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn set_reconnecting(&self, value: bool) {
        self.is_reconnecting.store(value, Ordering::SeqCst);
    }

    /// Buffers a chunk for replay after reconnection.
    ///
    /// A chunk larger than the whole buffer bound is rejected outright and
    /// does not mutate the buffer. Otherwise the oldest chunks are evicted
    /// FIFO until the new chunk fits.
    pub fn add_to_reconnection_buffer(&self, chunk: Bytes) -> bool {
        if chunk.len() > MAX_RECONNECT_BUFFER_BYTES {
            log::warn!(
                "[Session] {}: dropping oversized chunk ({} bytes > {} byte buffer)",
                self.session_id,
                chunk.len(),
                MAX_RECONNECT_BUFFER_BYTES
            );
            return false;
        }

        {
            let mut buffer = self.buffer.lock();
            while buffer.total_bytes + chunk.len() > MAX_RECONNECT_BUFFER_BYTES {
                match buffer.chunks.pop_front() {
                    Some(evicted) => {
                        buffer.total_bytes -= evicted.len();
                        log::debug!(
                            "[Session] {}: evicted {} buffered bytes to make room",
                            self.session_id,
                            evicted.len()
                        );
                    }
                    None => break,
                }
            }
            buffer.total_bytes += chunk.len();
            buffer.chunks.push_back(chunk);
        }
        self.metrics
            .buffered_chunks_during_reconnection
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drains the buffer in FIFO order.
    #[must_use]
    pub fn flush_reconnection_buffer(&self) -> Vec<Bytes> {
        let mut buffer = self.buffer.lock();
        buffer.total_bytes = 0;
        buffer.chunks.drain(..).collect()
    }

    /// Empties the buffer without returning the chunks.
    pub fn clear_reconnection_buffer(&self) {
        let mut buffer = self.buffer.lock();
        buffer.chunks.clear();
        buffer.total_bytes = 0;
    }

    /// Total bytes currently buffered.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.lock().total_bytes
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Finalization protocol plumbing
    // ─────────────────────────────────────────────────────────────────────────

    /// True while a finalization round (including its deferred flag-reset
    /// window) is in flight. The close handler reads this to suppress
    /// reconnection on the close that follows the terminator frame.
    #[must_use]
    pub fn is_finalizing(&self) -> bool {
        self.is_finalizing.load(Ordering::SeqCst)
    }

    /// Joins an in-flight finalization round or begins a new one.
    ///
    /// If a round is in flight and has not yet published its outcome, the
    /// caller receives that round's outcome receiver and must not send the
    /// terminator. Otherwise the provided channels are installed, any
    /// pre-existing deferred-reset timer is cancelled, and the caller owns
    /// the new round. The decision and installation are atomic.
    pub(crate) fn join_or_begin_finalization(
        &self,
        waiter: oneshot::Sender<FinalizeSignal>,
        outcome_rx: watch::Receiver<Option<FinalizeOutcome>>,
    ) -> Option<watch::Receiver<Option<FinalizeOutcome>>> {
        let mut finalize = self.finalize.lock();
        if self.is_finalizing.load(Ordering::SeqCst) {
            if let Some(rx) = finalize.outcome_rx.as_ref() {
                if rx.borrow().is_none() {
                    return Some(rx.clone());
                }
            }
        }

        if let Some(timer) = self.finalization_timer.lock().take() {
            timer.abort();
        }
        self.is_finalizing.store(true, Ordering::SeqCst);
        finalize.waiter = Some(waiter);
        finalize.outcome_rx = Some(outcome_rx);
        None
    }

    /// Resolves the in-flight finalization waiter, if one is installed.
    pub(crate) fn signal_finalize(&self, signal: FinalizeSignal) {
        let waiter = self.finalize.lock().waiter.take();
        if let Some(waiter) = waiter {
            let _ = waiter.send(signal);
        }
    }

    /// Removes the finalization waiter without resolving it.
    pub(crate) fn clear_finalize_waiter(&self) {
        self.finalize.lock().waiter = None;
    }

    /// Schedules the deferred reset of the finalizing flag.
    ///
    /// The window absorbs a provider close that trails the metadata
    /// acknowledgement by a few milliseconds; the close handler observes
    /// the flag still set and skips reconnection.
    pub(crate) fn schedule_finalization_reset(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(session) = weak.upgrade() {
                session.is_finalizing.store(false, Ordering::SeqCst);
            }
        });
        if let Some(previous) = self.finalization_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Records how the most recent finalization resolved.
    pub(crate) fn set_finalization_method(&self, method: FinalizationMethod) {
        *self.finalization_method.lock() = Some(method);
    }

    #[must_use]
    pub fn finalization_method(&self) -> Option<FinalizationMethod> {
        *self.finalization_method.lock()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Owned background tasks
    // ─────────────────────────────────────────────────────────────────────────

    /// Installs the keepalive ticker, cancelling any previous one.
    pub(crate) fn set_keepalive(&self, handle: TickerHandle) {
        if let Some(previous) = self.keepalive.lock().replace(handle) {
            previous.cancel();
        }
    }

    /// Cancels the keepalive ticker, if one is running.
    pub(crate) fn cancel_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.cancel();
        }
    }

    #[must_use]
    pub(crate) fn has_keepalive(&self) -> bool {
        self.keepalive.lock().is_some()
    }

    #[must_use]
    pub(crate) fn has_finalization_timer(&self) -> bool {
        self.finalization_timer.lock().is_some()
    }

    /// Installs the upstream event pump task, aborting any previous one.
    pub(crate) fn set_pump(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.pump.lock().replace(task) {
            previous.abort();
        }
    }

    /// Installs the reconnection task, aborting any previous one.
    pub(crate) fn set_reconnect_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics and teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Rough per-session memory footprint: transcript strings plus the
    /// reconnection buffer.
    #[must_use]
    pub fn memory_estimate_bytes(&self) -> usize {
        let transcript_bytes = {
            let transcript = self.transcript.lock();
            transcript.accumulated.len()
                + transcript.interim.len()
                + transcript.segments.iter().map(|s| s.text.len()).sum::<usize>()
        };
        transcript_bytes + self.buffered_bytes()
    }

    /// Serialized view of the session's counters and state.
    #[must_use]
    pub fn metrics_snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            session_id: self.session_id.clone(),
            connection_id: self.connection_id.clone(),
            connection_state: self.connection_state(),
            created_at_ms: self.created_at_ms,
            last_activity_ms: self.last_activity_ms(),
            last_transcript_ms: self.last_transcript_ms(),
            duration_ms: self.duration_ms(),
            chunks_received: self.metrics.chunks_received.load(Ordering::Relaxed),
            chunks_forwarded: self.metrics.chunks_forwarded.load(Ordering::Relaxed),
            transcripts_received: self.metrics.transcripts_received.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            reconnections: self.metrics.reconnections.load(Ordering::Relaxed),
            successful_reconnections: self
                .metrics
                .successful_reconnections
                .load(Ordering::Relaxed),
            failed_reconnections: self.metrics.failed_reconnections.load(Ordering::Relaxed),
            total_downtime_ms: self.metrics.total_downtime_ms.load(Ordering::Relaxed),
            buffered_chunks_during_reconnection: self
                .metrics
                .buffered_chunks_during_reconnection
                .load(Ordering::Relaxed),
            is_reconnecting: self.is_reconnecting(),
            buffered_bytes: self.buffered_bytes(),
            finalization_method: self.finalization_method(),
        }
    }

    /// Releases every resource the session owns.
    ///
    /// Idempotent and non-throwing: the keepalive ticker, finalization
    /// timer, reconnection task, and event pump are cancelled, the upstream
    /// handle is closed best-effort, the reconnection buffer is emptied,
    /// and the session is marked inactive. An in-flight finalization waiter
    /// is woken so it does not wait out its full timeout.
    pub async fn cleanup(&self) {
        if !self.is_active.swap(false, Ordering::SeqCst) {
            return;
        }

        self.cancel_keepalive();
        if let Some(timer) = self.finalization_timer.lock().take() {
            timer.abort();
        }
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
        self.signal_finalize(FinalizeSignal::ConnectionClosed);

        let client = self.take_client();
        if let Some(client) = client {
            client.close().await;
        }

        self.clear_reconnection_buffer();
        self.is_reconnecting.store(false, Ordering::SeqCst);
        self.set_connection_state(ConnectionState::Disconnected);
        log::debug!("[Session] {}: cleaned up", self.session_id);
    }

    /// True when no owned resource remains. Used by teardown assertions.
    #[must_use]
    pub fn is_released(&self) -> bool {
        !self.is_active()
            && self.client.lock().is_none()
            && self.keepalive.lock().is_none()
            && self.finalization_timer.lock().is_none()
            && self.buffer.lock().chunks.is_empty()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("connection_state", &self.connection_state())
            .field("is_active", &self.is_active())
            .field("is_reconnecting", &self.is_reconnecting())
            .field("is_finalizing", &self.is_finalizing())
            .finish_non_exhaustive()
    }
}
