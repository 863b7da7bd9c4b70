//! Classification of raw upstream failures into retry policy.
//!
//! The classifier is a pure function: given the same status, code, and
//! message it always produces the same category. Unknown failures default
//! to retryable, so an unrecognized error never strands a session.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// A raw failure reported by the upstream transport before classification.
///
/// Carries whatever the transport could extract: an HTTP-ish status, a
/// numeric provider code, and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    /// Failure message as reported by the socket or provider.
    pub message: String,
    /// HTTP status, when the failure came from a rejected handshake.
    pub status: Option<u16>,
    /// Numeric provider error code, when one was present.
    pub code: Option<u16>,
}

impl UpstreamFailure {
    /// A failure carrying only a message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    /// A failure carrying an HTTP status.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            code: None,
        }
    }
}

impl std::fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status.or(self.code) {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Category assigned to an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Client-side fault (4xx); retrying cannot succeed.
    Fatal,
    /// Server-side fault (429/5xx); worth retrying.
    Retryable,
    /// Network-level or timeout fault; worth retrying.
    Timeout,
    /// Unrecognized fault; treated as retryable (fail-safe).
    Unknown,
}

/// Result of classifying an [`UpstreamFailure`].
#[derive(Debug, Clone)]
pub struct ClassifiedFailure {
    /// Assigned category.
    pub kind: FailureKind,
    /// Whether the reconnection machinery should retry.
    pub retryable: bool,
    /// Extracted status code, when one was discernible.
    pub status_code: Option<u16>,
    /// Normalized human-readable message.
    pub message: String,
    /// The failure as originally reported.
    pub original: UpstreamFailure,
}

/// Message substrings that indicate a network-level or timeout fault.
const NETWORK_MARKERS: [&str; 8] = [
    "econnrefused",
    "etimedout",
    "econnreset",
    "network",
    "timeout",
    "socket",
    "closed",
    "websocket",
];

fn status_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"HTTP\s+(\d+)|^(\d+):").expect("valid status pattern"))
}

/// Extracts a status code from the failure.
///
/// Property-derived statuses win over message-derived ones: `.status`
/// first, then `.code`, then the first integer matching `HTTP \d+` or a
/// leading `\d+:` in the message.
fn extract_status(failure: &UpstreamFailure) -> Option<u16> {
    if let Some(status) = failure.status {
        return Some(status);
    }
    if let Some(code) = failure.code {
        return Some(code);
    }
    status_pattern()
        .captures(&failure.message)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|m| m.as_str().parse().ok())
}

fn fatal_message(status: u16) -> String {
    match status {
        400 => "Invalid request configuration".to_string(),
        401 => "Invalid API key".to_string(),
        403 => "Access forbidden".to_string(),
        404 => "Endpoint not found".to_string(),
        other => format!("Client error {other}"),
    }
}

fn retryable_message(status: u16) -> String {
    match status {
        429 => "Rate limit exceeded".to_string(),
        500 => "Server error".to_string(),
        502 => "Bad gateway".to_string(),
        503 => "Service unavailable".to_string(),
        504 => "Gateway timeout".to_string(),
        other => format!("Server error {other}"),
    }
}

/// Classifies a raw upstream failure.
#[must_use]
pub fn classify(failure: &UpstreamFailure) -> ClassifiedFailure {
    let status_code = extract_status(failure);

    if let Some(status) = status_code {
        // 429 retries despite being a 4xx; check the explicit retryable set
        // before the generic client-error range.
        if matches!(status, 429 | 500 | 502 | 503 | 504) || (500..600).contains(&status) {
            return ClassifiedFailure {
                kind: FailureKind::Retryable,
                retryable: true,
                status_code,
                message: retryable_message(status),
                original: failure.clone(),
            };
        }
        if (400..500).contains(&status) {
            return ClassifiedFailure {
                kind: FailureKind::Fatal,
                retryable: false,
                status_code,
                message: fatal_message(status),
                original: failure.clone(),
            };
        }
    }

    let lowered = failure.message.to_lowercase();
    if status_code.is_none() && NETWORK_MARKERS.iter().any(|m| lowered.contains(m)) {
        return ClassifiedFailure {
            kind: FailureKind::Timeout,
            retryable: true,
            status_code: None,
            message: "Network or timeout error".to_string(),
            original: failure.clone(),
        };
    }

    ClassifiedFailure {
        kind: FailureKind::Unknown,
        retryable: true,
        status_code,
        message: if failure.message.is_empty() {
            "Unknown error".to_string()
        } else {
            failure.message.clone()
        },
        original: failure.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_statuses_map_to_fixed_messages() {
        for (status, message) in [
            (400, "Invalid request configuration"),
            (401, "Invalid API key"),
            (403, "Access forbidden"),
            (404, "Endpoint not found"),
        ] {
            let classified = classify(&UpstreamFailure::with_status(status, "rejected"));
            assert_eq!(classified.kind, FailureKind::Fatal);
            assert!(!classified.retryable);
            assert_eq!(classified.status_code, Some(status));
            assert_eq!(classified.message, message);
        }
    }

    #[test]
    fn other_4xx_is_fatal_generic() {
        let classified = classify(&UpstreamFailure::with_status(418, "teapot"));
        assert_eq!(classified.kind, FailureKind::Fatal);
        assert_eq!(classified.message, "Client error 418");
    }

    #[test]
    fn retryable_statuses_map_to_fixed_messages() {
        for (status, message) in [
            (429, "Rate limit exceeded"),
            (500, "Server error"),
            (502, "Bad gateway"),
            (503, "Service unavailable"),
            (504, "Gateway timeout"),
        ] {
            let classified = classify(&UpstreamFailure::with_status(status, "rejected"));
            assert_eq!(classified.kind, FailureKind::Retryable);
            assert!(classified.retryable);
            assert_eq!(classified.message, message);
        }
    }

    #[test]
    fn other_5xx_is_retryable_generic() {
        let classified = classify(&UpstreamFailure::with_status(521, "down"));
        assert_eq!(classified.kind, FailureKind::Retryable);
        assert_eq!(classified.message, "Server error 521");
    }

    #[test]
    fn status_property_wins_over_message() {
        let failure = UpstreamFailure {
            message: "HTTP 401: Unauthorized".to_string(),
            status: Some(500),
            code: None,
        };
        let classified = classify(&failure);
        assert_eq!(classified.kind, FailureKind::Retryable);
        assert!(classified.retryable);
        assert_eq!(classified.status_code, Some(500));
    }

    #[test]
    fn status_wins_over_code() {
        let failure = UpstreamFailure {
            message: String::new(),
            status: Some(503),
            code: Some(401),
        };
        assert_eq!(classify(&failure).status_code, Some(503));
    }

    #[test]
    fn status_extracted_from_http_pattern() {
        let classified = classify(&UpstreamFailure::message("HTTP 404: no such model"));
        assert_eq!(classified.status_code, Some(404));
        assert_eq!(classified.kind, FailureKind::Fatal);
    }

    #[test]
    fn status_extracted_from_leading_digits() {
        let classified = classify(&UpstreamFailure::message("502: bad gateway"));
        assert_eq!(classified.status_code, Some(502));
        assert_eq!(classified.kind, FailureKind::Retryable);
    }

    #[test]
    fn network_markers_map_to_timeout() {
        for message in [
            "ECONNREFUSED while dialing",
            "socket hang up",
            "connection closed before handshake",
            "WebSocket protocol error",
            "read timeout",
        ] {
            let classified = classify(&UpstreamFailure::message(message));
            assert_eq!(classified.kind, FailureKind::Timeout, "message: {message}");
            assert!(classified.retryable);
            assert_eq!(classified.message, "Network or timeout error");
        }
    }

    #[test]
    fn unknown_defaults_to_retryable() {
        let classified = classify(&UpstreamFailure::message("something odd happened"));
        assert_eq!(classified.kind, FailureKind::Unknown);
        assert!(classified.retryable);
        assert_eq!(classified.message, "something odd happened");
    }

    #[test]
    fn empty_message_becomes_unknown_error() {
        let classified = classify(&UpstreamFailure::message(""));
        assert_eq!(classified.kind, FailureKind::Unknown);
        assert_eq!(classified.message, "Unknown error");
    }

    #[test]
    fn classification_is_deterministic() {
        let failure = UpstreamFailure {
            message: "HTTP 429: slow down".to_string(),
            status: None,
            code: None,
        };
        let first = classify(&failure);
        for _ in 0..10 {
            let again = classify(&failure);
            assert_eq!(again.kind, first.kind);
            assert_eq!(again.status_code, first.status_code);
            assert_eq!(again.message, first.message);
        }
    }
}
