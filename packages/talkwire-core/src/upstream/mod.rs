//! Upstream provider integration.
//!
//! Everything that touches the provider's streaming protocol lives here:
//! failure classification, the semantic event model, the transport seam
//! with its WebSocket implementation, and the connector that owns a
//! session's connection lifecycle.

use std::time::Duration;

pub mod classify;
pub mod client;
pub mod connector;
pub mod events;

#[cfg(test)]
pub(crate) mod test_support;

/// Control frame keeping an idle connection open.
pub(crate) const KEEPALIVE_FRAME: &str = r#"{"type":"KeepAlive"}"#;

/// Control frame requesting end-of-stream from the provider.
pub(crate) const TERMINATOR_FRAME: &str = r#"{"type":"CloseStream"}"#;

/// Period of the keepalive ticker.
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);
