//! Upstream connection lifecycle for a session.
//!
//! Responsibilities:
//! - Establish the provider connection with a bounded timeout
//! - Pump provider events through one fault-isolated dispatch task
//! - Run the keepalive ticker while the connection is open
//! - Reconnect with exponential backoff, buffering audio in the meantime
//! - Forward caller audio chunks, best-effort
//!
//! Public operations are invoked only by the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::error::SttResult;
use crate::session::{ConnectionState, FinalizeSignal, Session, TickerHandle};

use super::classify::{classify, ClassifiedFailure, FailureKind, UpstreamFailure};
use super::client::{ConnectParams, UpstreamClient, UpstreamTransport, EVENT_CHANNEL_CAPACITY};
use super::events::UpstreamEvent;
use super::{KEEPALIVE_FRAME, KEEPALIVE_INTERVAL};

/// Backoff ladder for reconnection attempts.
const RECONNECT_DELAYS_MS: [u64; 5] = [250, 500, 1_000, 2_000, 4_000];

/// Owns upstream connections on behalf of sessions.
pub struct UpstreamConnector {
    config: ServiceConfig,
    transport: Arc<dyn UpstreamTransport>,
}

impl UpstreamConnector {
    /// Creates a connector over the given transport.
    #[must_use]
    pub fn new(config: ServiceConfig, transport: Arc<dyn UpstreamTransport>) -> Self {
        Self { config, transport }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connect
    // ─────────────────────────────────────────────────────────────────────────

    /// Establishes the upstream connection for a session.
    ///
    /// On success the session is connected, the keepalive ticker is
    /// running, and - when a reconnection round triggered the call - the
    /// buffered audio has been replayed in FIFO order.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<(), ClassifiedFailure> {
        let params = self.build_params(session)?;
        session.set_connection_state(ConnectionState::Connecting);

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        match self.transport.connect(&params, events_tx).await {
            Ok(client) => {
                log::info!(
                    "[Upstream] {}: connected (attempt {})",
                    session.session_id,
                    client.attempt_id()
                );
                session.install_client(Arc::clone(&client));
                session.set_connection_state(ConnectionState::Connected);
                self.spawn_event_pump(session, events_rx);
                self.start_keepalive(session, Arc::clone(&client));

                if session.is_reconnecting() {
                    self.flush_buffered_audio(session, client.as_ref()).await;
                    session.set_reconnecting(false);
                }
                Ok(())
            }
            Err(failure) => {
                log::warn!(
                    "[Upstream] {}: connect failed: {}",
                    session.session_id,
                    failure.message
                );
                session.set_connection_state(if failure.kind == FailureKind::Fatal {
                    ConnectionState::Error
                } else {
                    ConnectionState::Disconnected
                });
                Err(failure)
            }
        }
    }

    fn build_params(&self, session: &Arc<Session>) -> Result<ConnectParams, ClassifiedFailure> {
        let Some(api_key) = self.config.api_key.clone().filter(|k| !k.is_empty()) else {
            return Err(classify(&UpstreamFailure::with_status(
                401,
                "upstream API key not configured",
            )));
        };
        Ok(ConnectParams {
            endpoint: self.config.endpoint.clone(),
            api_key,
            sample_rate: session.config.sample_rate,
            language: session.config.language.clone(),
            model: session.config.model.clone(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event dispatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Spawns the per-session dispatch task consuming provider events.
    ///
    /// The task holds only a weak session reference, so a cleaned-up
    /// session is never kept alive through its own event pump.
    fn spawn_event_pump(
        self: &Arc<Self>,
        session: &Arc<Session>,
        mut events: mpsc::Receiver<UpstreamEvent>,
    ) {
        let connector = Arc::clone(self);
        let weak = Arc::downgrade(session);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else { break };
                connector.dispatch_event(&session, event);
            }
        });
        session.set_pump(pump);
    }

    /// Routes one provider event to its handler.
    ///
    /// Every arm runs behind a failure boundary: a handler error is
    /// logged, counted against the session, and suppressed so the
    /// connection and the remaining handlers stay live.
    fn dispatch_event(self: &Arc<Self>, session: &Arc<Session>, event: UpstreamEvent) {
        let result: SttResult<()> = match event {
            UpstreamEvent::Open => self.handle_open(session),
            UpstreamEvent::Transcript {
                text,
                confidence,
                is_final,
            } => self.handle_transcript(session, &text, confidence, is_final),
            UpstreamEvent::Metadata => self.handle_metadata(session),
            UpstreamEvent::SpeechStarted => self.handle_speech_started(session),
            UpstreamEvent::UtteranceEnd => self.handle_utterance_end(session),
            UpstreamEvent::Close { code, reason } => self.handle_close(session, code, &reason),
            UpstreamEvent::Error(failure) => self.handle_error(session, &failure),
        };

        if let Err(e) = result {
            session.metrics.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            log::error!(
                "[Upstream] {}: event handler failed: {}",
                session.session_id,
                e
            );
        }
    }

    fn handle_open(&self, session: &Arc<Session>) -> SttResult<()> {
        session.set_connection_state(ConnectionState::Connected);
        session.touch();
        Ok(())
    }

    fn handle_transcript(
        &self,
        session: &Arc<Session>,
        text: &str,
        confidence: f64,
        is_final: bool,
    ) -> SttResult<()> {
        tracing::debug!(
            session = %session.session_id,
            is_final,
            confidence,
            "transcript fragment"
        );
        session.add_transcript(text, confidence, is_final);
        Ok(())
    }

    fn handle_metadata(&self, session: &Arc<Session>) -> SttResult<()> {
        log::debug!("[Upstream] {}: end-of-stream acknowledged", session.session_id);
        session.signal_finalize(FinalizeSignal::Metadata);
        Ok(())
    }

    fn handle_speech_started(&self, session: &Arc<Session>) -> SttResult<()> {
        session.touch();
        log::trace!("[Upstream] {}: speech started", session.session_id);
        Ok(())
    }

    fn handle_utterance_end(&self, session: &Arc<Session>) -> SttResult<()> {
        session.touch();
        log::trace!("[Upstream] {}: utterance end", session.session_id);
        Ok(())
    }

    /// Close handler.
    ///
    /// Always cancels the keepalive ticker, clears the handle, and marks
    /// the session disconnected. A close observed during finalization is
    /// the expected consequence of the terminator frame and must not start
    /// recovery; any other close on an active session does.
    fn handle_close(self: &Arc<Self>, session: &Arc<Session>, code: u16, reason: &str) -> SttResult<()> {
        log::info!(
            "[Upstream] {}: connection closed (code {code}, reason {reason:?})",
            session.session_id
        );
        session.cancel_keepalive();
        session.set_connection_state(ConnectionState::Disconnected);
        drop(session.take_client());
        // An acknowledgement that never arrived is not going to; wake the
        // waiter so finalization falls back instead of waiting out 5s.
        session.signal_finalize(FinalizeSignal::ConnectionClosed);

        if session.is_finalizing() {
            log::debug!(
                "[Upstream] {}: close during finalization, not reconnecting",
                session.session_id
            );
            return Ok(());
        }
        if session.is_active() {
            self.schedule_reconnect(session);
        }
        Ok(())
    }

    /// Error handler.
    ///
    /// Fatal failures stop the stream without tearing other state down
    /// (the trailing close event does that). Everything else behaves like
    /// an unexpected close and schedules recovery.
    fn handle_error(
        self: &Arc<Self>,
        session: &Arc<Session>,
        failure: &UpstreamFailure,
    ) -> SttResult<()> {
        let classified = classify(failure);
        match classified.kind {
            FailureKind::Fatal => {
                session.metrics.errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                session.set_connection_state(ConnectionState::Error);
                log::error!(
                    "[Upstream] {}: fatal upstream error: {}",
                    session.session_id,
                    classified.message
                );
            }
            _ => {
                log::warn!(
                    "[Upstream] {}: retryable upstream error: {}",
                    session.session_id,
                    classified.message
                );
                if session.is_active() && !session.is_finalizing() {
                    self.schedule_reconnect(session);
                }
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keepalive
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts the keepalive ticker for an open connection.
    fn start_keepalive(&self, session: &Arc<Session>, client: Arc<dyn UpstreamClient>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let session_id = session.session_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(KEEPALIVE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the connection is brand new.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.send_control(KEEPALIVE_FRAME).await {
                            log::debug!("[Upstream] {session_id}: keepalive failed, connection gone: {e}");
                            break;
                        }
                        log::trace!("[Upstream] {session_id}: keepalive sent");
                    }
                }
            }
        });
        session.set_keepalive(TickerHandle::new(cancel, task));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconnection
    // ─────────────────────────────────────────────────────────────────────────

    /// Starts a reconnection round unless one is already in flight.
    ///
    /// Retries on the backoff ladder; on success the buffered audio is
    /// replayed by `connect`. On exhaustion the buffer is dropped (data
    /// loss acknowledged) and the session stays registered so the caller
    /// can still finalize and end it.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>, session: &Arc<Session>) {
        if !session.is_active() || session.is_finalizing() {
            return;
        }
        if !session.begin_reconnecting() {
            return;
        }
        session
            .metrics
            .reconnections
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        log::warn!(
            "[Upstream] {}: connection lost, starting reconnection",
            session.session_id
        );

        let connector = Arc::clone(self);
        let weak = Arc::downgrade(session);
        let downtime_start = Instant::now();
        let task = tokio::spawn(async move {
            for (attempt, delay_ms) in RECONNECT_DELAYS_MS.iter().enumerate() {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                let Some(session) = weak.upgrade() else { return };
                if !session.is_active() {
                    return;
                }
                log::info!(
                    "[Upstream] {}: reconnecting (attempt {}/{})",
                    session.session_id,
                    attempt + 1,
                    RECONNECT_DELAYS_MS.len()
                );
                match connector.connect(&session).await {
                    Ok(()) => {
                        session
                            .metrics
                            .successful_reconnections
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        session.metrics.total_downtime_ms.fetch_add(
                            downtime_start.elapsed().as_millis() as u64,
                            std::sync::atomic::Ordering::Relaxed,
                        );
                        log::info!(
                            "[Upstream] {}: reconnected after {} attempt(s)",
                            session.session_id,
                            attempt + 1
                        );
                        return;
                    }
                    Err(failure) if failure.retryable => {
                        log::warn!(
                            "[Upstream] {}: reconnect attempt {} failed: {}",
                            session.session_id,
                            attempt + 1,
                            failure.message
                        );
                    }
                    Err(failure) => {
                        log::error!(
                            "[Upstream] {}: fatal error during reconnect: {}",
                            session.session_id,
                            failure.message
                        );
                        break;
                    }
                }
            }

            let Some(session) = weak.upgrade() else { return };
            session
                .metrics
                .failed_reconnections
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            session.clear_reconnection_buffer();
            session.set_reconnecting(false);
            log::error!(
                "[Upstream] {}: reconnection exhausted, buffered audio dropped",
                session.session_id
            );
        });
        session.set_reconnect_task(task);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audio forwarding
    // ─────────────────────────────────────────────────────────────────────────

    /// Forwards one caller audio chunk, best-effort.
    ///
    /// During reconnection chunks are diverted into the bounded buffer.
    /// After a finalization-window close left the session without a
    /// handle, forwarding re-establishes the connection lazily, buffering
    /// the triggering chunk so it survives.
    pub(crate) async fn forward_chunk(self: &Arc<Self>, session: &Arc<Session>, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        session.touch();
        session
            .metrics
            .chunks_received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if session.is_reconnecting() {
            session.add_to_reconnection_buffer(chunk);
            return;
        }

        let Some(client) = session.client() else {
            if session.is_active()
                && !session.is_finalizing()
                && session.connection_state() == ConnectionState::Disconnected
            {
                session.add_to_reconnection_buffer(chunk);
                self.schedule_reconnect(session);
            }
            return;
        };

        match client.send_audio(chunk).await {
            Ok(()) => {
                let forwarded = session
                    .metrics
                    .chunks_forwarded
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                if forwarded % 10 == 0 {
                    log::debug!(
                        "[Upstream] {}: forwarded {forwarded} chunk(s)",
                        session.session_id
                    );
                }
            }
            Err(e) => {
                let errors = session
                    .metrics
                    .errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                if errors % 10 == 0 {
                    log::warn!(
                        "[Upstream] {}: audio send failing ({errors} errors so far): {e}",
                        session.session_id
                    );
                } else {
                    log::debug!("[Upstream] {}: audio send failed: {e}", session.session_id);
                }
            }
        }
    }

    /// Replays buffered audio in FIFO order after a reconnect.
    async fn flush_buffered_audio(&self, session: &Arc<Session>, client: &dyn UpstreamClient) {
        let chunks = session.flush_reconnection_buffer();
        if chunks.is_empty() {
            return;
        }
        log::info!(
            "[Upstream] {}: replaying {} buffered chunk(s)",
            session.session_id,
            chunks.len()
        );
        for chunk in chunks {
            match client.send_audio(chunk).await {
                Ok(()) => {
                    session
                        .metrics
                        .chunks_forwarded
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    session
                        .metrics
                        .errors
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    log::warn!(
                        "[Upstream] {}: failed to replay buffered chunk: {e}",
                        session.session_id
                    );
                }
            }
        }
    }
}
