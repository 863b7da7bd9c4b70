//! Centralized error types for the Talkwire relay core.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to machine-readable codes for the owning gateway layer
//! - Separates caller faults from upstream faults (see the upstream
//!   classifier in [`crate::upstream::classify`] for the latter)

use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the STT relay core.
#[derive(Debug, Error)]
pub enum SttError {
    /// Caller passed a bad session id or an out-of-range sampling rate.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Session creation was attempted while the service is shutting down.
    #[error("Service is shutting down")]
    ServiceUnavailable,

    /// The upstream connection did not reach the open state within the
    /// connect timeout, or was rejected with a fatal status.
    #[error("Upstream connect failed: {0}")]
    UpstreamConnectFailed(String),

    /// The provider rejected our credentials (401/403).
    #[error("Upstream authentication failed: {0}")]
    UpstreamAuthFailed(String),

    /// Network/timeout/5xx failure. Never surfaced to the caller mid-session;
    /// handled by the reconnection machinery.
    #[error("Transient upstream failure: {0}")]
    UpstreamTransient(String),

    /// Fatal (4xx) provider failure after the session was open.
    #[error("Fatal upstream failure mid-stream: {0}")]
    UpstreamFatalMidstream(String),

    /// Programming error inside an event handler. Always caught at the
    /// per-handler boundary and counted, never propagated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ErrorCode for SttError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ServiceUnavailable => "service_unavailable",
            Self::UpstreamConnectFailed(_) => "upstream_connect_failed",
            Self::UpstreamAuthFailed(_) => "upstream_auth_failed",
            Self::UpstreamTransient(_) => "upstream_transient",
            Self::UpstreamFatalMidstream(_) => "upstream_fatal_midstream",
            Self::Internal(_) => "internal",
        }
    }
}

/// Convenient Result alias for relay-core operations.
pub type SttResult<T> = Result<T, SttError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(SttError::InvalidArgument("x".into()).code(), "invalid_argument");
        assert_eq!(SttError::ServiceUnavailable.code(), "service_unavailable");
        assert_eq!(
            SttError::UpstreamConnectFailed("x".into()).code(),
            "upstream_connect_failed"
        );
        assert_eq!(
            SttError::UpstreamAuthFailed("x".into()).code(),
            "upstream_auth_failed"
        );
        assert_eq!(SttError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn display_includes_detail() {
        let err = SttError::InvalidArgument("sampling rate 96000 out of range".into());
        assert!(err.to_string().contains("96000"));
    }
}
