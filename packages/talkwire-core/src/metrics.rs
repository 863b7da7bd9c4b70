//! Aggregated service metrics.
//!
//! The aggregate is computed on demand from the registered sessions
//! rather than maintained incrementally; readers pay a small scan cost in
//! exchange for simpler invariants. Peak concurrency is the exception -
//! it is tracked at create time because it cannot be reconstructed from a
//! read-side scan.

use serde::Serialize;

/// Service-wide metrics view, aggregated across sessions on demand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    /// Sessions currently registered.
    pub active_sessions: usize,
    /// Sessions created over the process lifetime. Monotonic.
    pub total_sessions_created: u64,
    /// Sessions torn down over the process lifetime. Monotonic.
    pub total_sessions_cleaned: u64,
    /// Highest concurrent session count observed. Monotonic.
    pub peak_concurrent_sessions: u64,
    /// Sum of per-session chunk intake counters.
    pub total_chunks_received: u64,
    /// Sum of per-session forwarded-chunk counters.
    pub total_chunks_forwarded: u64,
    /// Sum of per-session transcript counters.
    pub total_transcripts_received: u64,
    /// Sum of per-session error counters.
    pub total_errors: u64,
    /// Sum of per-session reconnection-round counters.
    pub total_reconnections: u64,
    /// Sum of per-session successful reconnections.
    pub successful_reconnections: u64,
    /// Sum of per-session exhausted reconnections.
    pub failed_reconnections: u64,
    /// Mean session age in milliseconds (0 with no sessions).
    pub average_session_duration_ms: f64,
    /// Rough footprint of transcripts plus reconnection buffers, in MB.
    pub memory_usage_estimate_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let metrics = ServiceMetrics {
            active_sessions: 2,
            total_sessions_created: 5,
            total_sessions_cleaned: 3,
            peak_concurrent_sessions: 4,
            total_chunks_received: 100,
            total_chunks_forwarded: 98,
            total_transcripts_received: 40,
            total_errors: 2,
            total_reconnections: 1,
            successful_reconnections: 1,
            failed_reconnections: 0,
            average_session_duration_ms: 1234.5,
            memory_usage_estimate_mb: 0.25,
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["activeSessions"], 2);
        assert_eq!(json["peakConcurrentSessions"], 4);
        assert_eq!(json["memoryUsageEstimateMb"], 0.25);
    }
}
