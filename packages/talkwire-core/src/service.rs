//! STT relay orchestrator.
//!
//! Public façade over the registry and the upstream connector. The owning
//! WebSocket gateway calls `create_session` on client connect,
//! `forward_chunk` per audio frame, `finalize_transcript` at end of
//! utterance, and `end_session` on disconnect. Finalization deliberately
//! keeps the upstream connection open so consecutive utterances pay no
//! reconnect latency.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ServiceConfig, SessionConfig, SttConfig};
use crate::error::{SttError, SttResult};
use crate::metrics::ServiceMetrics;
use crate::registry::SessionRegistry;
use crate::session::{
    FinalizationMethod, FinalizeOutcome, FinalizeSignal, SessionMetricsSnapshot, TickerHandle,
};
use crate::upstream::classify::ClassifiedFailure;
use crate::upstream::client::{UpstreamTransport, WsUpstreamTransport};
use crate::upstream::connector::UpstreamConnector;
use crate::upstream::TERMINATOR_FRAME;
use crate::utils::now_millis;

/// Bound on the wait for the provider's end-of-stream acknowledgement.
const METADATA_WAIT: Duration = Duration::from_secs(5);

/// Deferred reset of the finalizing flag; absorbs the provider close that
/// trails the acknowledgement by a few milliseconds.
const FINALIZE_RESET_DELAY: Duration = Duration::from_millis(100);

/// Period of the idle-session sweep.
const CLEANUP_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A session idle longer than this is reaped by the sweep.
const IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1_000;

/// A session older than this is reaped regardless of activity.
const HARD_TIMEOUT_MS: u64 = 60 * 60 * 1_000;

/// Per-session teardown budget during shutdown.
const SHUTDOWN_SESSION_BUDGET: Duration = Duration::from_secs(5);

/// Options for [`SttService::shutdown`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownOptions {
    /// Re-arm the service after teardown. Test-only affordance.
    pub restart: bool,
}

/// The STT relay service.
///
/// Constructed once and handed to the owning gateway; there is no
/// ambient global instance. Construction requires a Tokio runtime (the
/// cleanup sweep starts immediately).
pub struct SttService {
    config: ServiceConfig,
    registry: Arc<SessionRegistry>,
    connector: Arc<UpstreamConnector>,
    is_shutting_down: AtomicBool,
    cleanup_ticker: Mutex<Option<TickerHandle>>,
    total_sessions_created: AtomicU64,
    total_sessions_cleaned: AtomicU64,
    peak_concurrent_sessions: AtomicU64,
}

impl SttService {
    /// Creates the service over the production WebSocket transport.
    #[must_use]
    pub fn new(config: ServiceConfig) -> Arc<Self> {
        Self::with_transport(config, Arc::new(WsUpstreamTransport::new()))
    }

    /// Creates the service over a caller-supplied transport (tests, or an
    /// embedder with its own socket stack).
    #[must_use]
    pub fn with_transport(config: ServiceConfig, transport: Arc<dyn UpstreamTransport>) -> Arc<Self> {
        let connector = Arc::new(UpstreamConnector::new(config.clone(), transport));
        let service = Arc::new(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            connector,
            is_shutting_down: AtomicBool::new(false),
            cleanup_ticker: Mutex::new(None),
            total_sessions_created: AtomicU64::new(0),
            total_sessions_cleaned: AtomicU64::new(0),
            peak_concurrent_sessions: AtomicU64::new(0),
        });
        service.start_cleanup_ticker();
        service
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Creates a session and connects it upstream.
    ///
    /// Returns once the provider reports open or the attempt fails. A
    /// session already registered under the same id is torn down first.
    ///
    /// # Errors
    ///
    /// `service_unavailable` during shutdown, `invalid_argument` for a bad
    /// id or sampling rate, `upstream_auth_failed` / `upstream_connect_failed`
    /// when the provider rejects or never opens the connection.
    pub async fn create_session(&self, config: SttConfig) -> SttResult<()> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            return Err(SttError::ServiceUnavailable);
        }
        config.validate()?;

        if self.registry.has_session(&config.session_id) {
            log::warn!(
                "[Stt] session {} already exists, replacing stale entry",
                config.session_id
            );
            self.registry.delete_session(&config.session_id).await;
            self.total_sessions_cleaned.fetch_add(1, Ordering::Relaxed);
        }

        let resolved = SessionConfig::resolve(&config, &self.config);
        let session =
            self.registry
                .create_session(&config.session_id, &config.connection_id, resolved);
        self.total_sessions_created.fetch_add(1, Ordering::Relaxed);
        self.peak_concurrent_sessions
            .fetch_max(self.registry.session_count() as u64, Ordering::Relaxed);

        match self.connector.connect(&session).await {
            Ok(()) => {
                log::info!(
                    "[Stt] session {} connected ({} Hz, {})",
                    config.session_id,
                    session.config.sample_rate,
                    session.config.language
                );
                Ok(())
            }
            Err(failure) => {
                self.registry.delete_session(&config.session_id).await;
                self.total_sessions_cleaned.fetch_add(1, Ordering::Relaxed);
                Err(Self::connect_error(failure))
            }
        }
    }

    fn connect_error(failure: ClassifiedFailure) -> SttError {
        match failure.status_code {
            Some(401 | 403) => SttError::UpstreamAuthFailed(failure.message),
            _ => SttError::UpstreamConnectFailed(failure.message),
        }
    }

    /// Forwards one audio chunk, fire-and-forget.
    ///
    /// A non-existent session is a warning, not an error.
    pub async fn forward_chunk(&self, session_id: &str, chunk: Bytes) {
        let Some(session) = self.registry.get_session(session_id) else {
            log::warn!("[Stt] audio for unknown session {session_id}");
            return;
        };
        self.connector.forward_chunk(&session, chunk).await;
    }

    /// Flushes in-flight audio at the provider and returns the
    /// authoritative transcript for the just-completed utterance.
    ///
    /// The upstream connection is preserved; the same session may be
    /// finalized arbitrarily many times. A call concurrent with an
    /// in-flight finalization joins that round and receives the same
    /// transcript without duplicating the terminator frame. Returns an
    /// empty string for an unknown session.
    pub async fn finalize_transcript(&self, session_id: &str) -> String {
        let Some(session) = self.registry.get_session(session_id) else {
            log::debug!("[Stt] finalize for unknown session {session_id}");
            return String::new();
        };

        let (signal_tx, signal_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        if let Some(mut shared) = session.join_or_begin_finalization(signal_tx, outcome_rx) {
            log::debug!("[Stt] {session_id}: joining in-flight finalization");
            let grace = METADATA_WAIT + Duration::from_secs(1);
            return match timeout(grace, shared.wait_for(|outcome| outcome.is_some())).await {
                Ok(Ok(outcome)) => outcome
                    .as_ref()
                    .map(|o| o.transcript.clone())
                    .unwrap_or_default(),
                _ => session.get_final_transcript(),
            };
        }

        let method = match session.client() {
            Some(client) => {
                if client.is_open() {
                    if let Err(e) = client.send_control(TERMINATOR_FRAME).await {
                        log::debug!(
                            "[Stt] {session_id}: terminator send failed (connection likely gone): {e}"
                        );
                    }
                }
                match timeout(METADATA_WAIT, signal_rx).await {
                    Ok(Ok(FinalizeSignal::Metadata)) => FinalizationMethod::Event,
                    // An unexpected close promotes the waiter to the
                    // timeout path instead of letting it run the full wait.
                    Ok(Ok(FinalizeSignal::ConnectionClosed)) => FinalizationMethod::Timeout,
                    Ok(Err(_)) | Err(_) => FinalizationMethod::Timeout,
                }
            }
            None => FinalizationMethod::None,
        };

        session.clear_finalize_waiter();
        let transcript = session.get_final_transcript();
        session.reset_accumulator();
        session.set_finalization_method(method);
        session.schedule_finalization_reset(FINALIZE_RESET_DELAY);
        let _ = outcome_tx.send(Some(FinalizeOutcome {
            transcript: transcript.clone(),
            method,
        }));

        log::info!(
            "[Stt] {session_id}: finalized via {method:?} ({} chars)",
            transcript.len()
        );
        transcript
    }

    /// Tears a session down and returns its accumulator snapshot.
    ///
    /// Never fails; returns an empty string for an unknown session. Does
    /// not perform the finalization handshake - callers wanting the
    /// authoritative transcript must finalize first.
    pub async fn end_session(&self, session_id: &str) -> String {
        let Some(session) = self.registry.get_session(session_id) else {
            return String::new();
        };
        let transcript = session.get_final_transcript();
        self.registry.delete_session(session_id).await;
        self.total_sessions_cleaned.fetch_add(1, Ordering::Relaxed);
        log::info!("[Stt] session {session_id} ended");
        transcript
    }

    /// Shuts the service down.
    ///
    /// Subsequent `create_session` calls fail until (and unless) the
    /// restart option re-arms the service. Each session gets a bounded
    /// teardown budget; on overrun it is cleaned up forcibly.
    pub async fn shutdown(self: &Arc<Self>, options: ShutdownOptions) {
        log::info!(
            "[Stt] shutting down ({} session(s)){}",
            self.registry.session_count(),
            if options.restart { ", restart requested" } else { "" }
        );
        self.is_shutting_down.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.cleanup_ticker.lock().take() {
            ticker.cancel();
        }

        for session in self.registry.get_all_sessions() {
            let id = session.session_id.clone();
            match timeout(SHUTDOWN_SESSION_BUDGET, self.end_session(&id)).await {
                Ok(_) => {}
                Err(_) => {
                    log::warn!("[Stt] {id}: shutdown budget exceeded, forcing cleanup");
                    session.cleanup().await;
                    self.registry.remove_session(&id);
                    self.total_sessions_cleaned.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if options.restart {
            self.is_shutting_down.store(false, Ordering::SeqCst);
            self.start_cleanup_ticker();
            log::info!("[Stt] restarted after shutdown");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Idle sweep
    // ─────────────────────────────────────────────────────────────────────────

    fn start_cleanup_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(service) = weak.upgrade() else { break };
                        service.sweep_idle_sessions().await;
                    }
                }
            }
        });
        if let Some(previous) = self
            .cleanup_ticker
            .lock()
            .replace(TickerHandle::new(cancel, task))
        {
            previous.cancel();
        }
    }

    /// Reaps sessions past the idle or hard timeout. Each reap is a plain
    /// `end_session`, which never fails, so one bad session cannot stall
    /// the sweep.
    pub(crate) async fn sweep_idle_sessions(&self) {
        let now = now_millis();
        for session in self.registry.get_all_sessions() {
            let idle_ms = now.saturating_sub(session.last_activity_ms());
            let age_ms = now.saturating_sub(session.created_at_ms);
            if idle_ms > IDLE_TIMEOUT_MS || age_ms > HARD_TIMEOUT_MS {
                log::info!(
                    "[Stt] reaping session {} (idle {idle_ms}ms, age {age_ms}ms)",
                    session.session_id
                );
                self.end_session(&session.session_id).await;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Aggregates metrics across all registered sessions.
    #[must_use]
    pub fn metrics(&self) -> ServiceMetrics {
        let sessions = self.registry.get_all_sessions();
        let mut total_chunks_received = 0;
        let mut total_chunks_forwarded = 0;
        let mut total_transcripts_received = 0;
        let mut total_errors = 0;
        let mut total_reconnections = 0;
        let mut successful_reconnections = 0;
        let mut failed_reconnections = 0;
        let mut duration_sum_ms: u128 = 0;
        let mut memory_bytes = 0usize;

        for session in &sessions {
            total_chunks_received += session.metrics.chunks_received.load(Ordering::Relaxed);
            total_chunks_forwarded += session.metrics.chunks_forwarded.load(Ordering::Relaxed);
            total_transcripts_received +=
                session.metrics.transcripts_received.load(Ordering::Relaxed);
            total_errors += session.metrics.errors.load(Ordering::Relaxed);
            total_reconnections += session.metrics.reconnections.load(Ordering::Relaxed);
            successful_reconnections += session
                .metrics
                .successful_reconnections
                .load(Ordering::Relaxed);
            failed_reconnections += session.metrics.failed_reconnections.load(Ordering::Relaxed);
            duration_sum_ms += u128::from(session.duration_ms());
            memory_bytes += session.memory_estimate_bytes();
        }

        let average_session_duration_ms = if sessions.is_empty() {
            0.0
        } else {
            duration_sum_ms as f64 / sessions.len() as f64
        };

        ServiceMetrics {
            active_sessions: sessions.len(),
            total_sessions_created: self.total_sessions_created.load(Ordering::Relaxed),
            total_sessions_cleaned: self.total_sessions_cleaned.load(Ordering::Relaxed),
            peak_concurrent_sessions: self.peak_concurrent_sessions.load(Ordering::Relaxed),
            total_chunks_received,
            total_chunks_forwarded,
            total_transcripts_received,
            total_errors,
            total_reconnections,
            successful_reconnections,
            failed_reconnections,
            average_session_duration_ms,
            memory_usage_estimate_mb: memory_bytes as f64 / (1024.0 * 1024.0),
        }
    }

    /// Per-session metrics view, including connection state.
    #[must_use]
    pub fn session_metrics(&self, session_id: &str) -> Option<SessionMetricsSnapshot> {
        self.registry
            .get_session(session_id)
            .map(|session| session.metrics_snapshot())
    }

    /// True iff an API key is configured.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.config.has_api_key()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    /// The session registry (for the owning gateway's introspection).
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}
