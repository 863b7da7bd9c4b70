//! Talkwire Core - STT relay for the Talkwire voice backend.
//!
//! This crate is the speech-to-text relay core of the Talkwire realtime
//! voice backend. It mediates between the client-facing WebSocket gateway
//! (which delivers PCM audio chunks) and an upstream streaming
//! transcription provider, holding one persistent provider connection per
//! user session, forwarding audio with bounded latency, accumulating the
//! authoritative transcript per recording turn, and returning it on
//! demand - while tolerating transient network failures without losing
//! audio or producing duplicate transcripts.
//!
//! # Architecture
//!
//! The crate is organized into a handful of modules:
//!
//! - [`service`]: The orchestrator the gateway talks to ([`SttService`])
//! - [`registry`]: Process-wide session storage
//! - [`session`]: Per-session state, transcript accumulator, buffers
//! - [`upstream`]: Provider protocol - classification, events, transport,
//!   connection lifecycle
//! - [`config`]: Startup configuration with environment overrides
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! The upstream socket sits behind two traits so the core can be driven
//! against a mock provider:
//!
//! - [`UpstreamTransport`](upstream::client::UpstreamTransport): dials a
//!   provider connection
//! - [`UpstreamClient`](upstream::client::UpstreamClient): one open
//!   connection (audio writes, control frames, close)
//!
//! The production implementation speaks a Deepgram-compatible WebSocket
//! protocol; the orchestrator never sees a socket type.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod session;
pub mod upstream;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::{ServiceConfig, SessionConfig, SttConfig, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
pub use error::{ErrorCode, SttError, SttResult};
pub use metrics::ServiceMetrics;
pub use registry::SessionRegistry;
pub use service::{ShutdownOptions, SttService};
pub use session::{
    ConnectionState, FinalizationMethod, Session, SessionMetricsSnapshot, TranscriptSegment,
    MAX_RECONNECT_BUFFER_BYTES,
};
pub use utils::now_millis;

// Re-export the upstream seam for embedders and tests
pub use upstream::classify::{classify, ClassifiedFailure, FailureKind, UpstreamFailure};
pub use upstream::client::{ConnectParams, UpstreamClient, UpstreamTransport, WsUpstreamTransport};
pub use upstream::events::UpstreamEvent;
