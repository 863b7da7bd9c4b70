//! Service and per-session configuration.
//!
//! [`ServiceConfig`] is the single source of truth read at startup (no
//! runtime mutation): API key, provider endpoint, and defaults. Environment
//! overrides follow the `TALKWIRE_STT_*` convention. [`SttConfig`] carries
//! the caller-supplied parameters for one session.

use serde::{Deserialize, Serialize};

use crate::error::{SttError, SttResult};

/// Lowest sampling rate accepted for a session (Hz).
pub const MIN_SAMPLE_RATE: u32 = 8_000;
/// Highest sampling rate accepted for a session (Hz).
pub const MAX_SAMPLE_RATE: u32 = 48_000;

/// Default streaming endpoint of the upstream transcription provider.
const DEFAULT_ENDPOINT: &str = "wss://api.deepgram.com/v1/listen";

/// Service-level configuration for the relay core.
///
/// All fields have sensible defaults except the API key, whose absence
/// leaves the service unhealthy (session creation fails closed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Upstream provider API key.
    /// Override: `TALKWIRE_STT_API_KEY`
    pub api_key: Option<String>,

    /// Upstream streaming endpoint URL.
    /// Override: `TALKWIRE_STT_ENDPOINT` (tests point this at a mock server)
    pub endpoint: String,

    /// Default language tag for sessions that don't specify one.
    /// Override: `TALKWIRE_STT_LANGUAGE`
    pub default_language: String,

    /// Default transcription model identifier.
    /// Override: `TALKWIRE_STT_MODEL`
    pub default_model: String,

    /// Default sampling rate (Hz) for sessions that don't specify one.
    /// Override: `TALKWIRE_STT_SAMPLE_RATE`
    pub default_sample_rate: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            default_language: "en-US".to_string(),
            default_model: "nova-3".to_string(),
            default_sample_rate: 16_000,
        }
    }
}

impl ServiceConfig {
    /// Builds a configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TALKWIRE_STT_API_KEY") {
            if !val.is_empty() {
                self.api_key = Some(val);
            }
        }

        if let Ok(val) = std::env::var("TALKWIRE_STT_ENDPOINT") {
            if !val.is_empty() {
                self.endpoint = val;
            }
        }

        if let Ok(val) = std::env::var("TALKWIRE_STT_LANGUAGE") {
            if !val.is_empty() {
                self.default_language = val;
            }
        }

        if let Ok(val) = std::env::var("TALKWIRE_STT_MODEL") {
            if !val.is_empty() {
                self.default_model = val;
            }
        }

        if let Ok(val) = std::env::var("TALKWIRE_STT_SAMPLE_RATE") {
            if let Ok(rate) = val.parse() {
                self.default_sample_rate = rate;
            }
        }
    }

    /// Whether an API key is configured and non-empty.
    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Caller-supplied parameters for one STT session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttConfig {
    /// Opaque session identifier, provided by the owning gateway.
    pub session_id: String,
    /// Caller-scoped connection identifier (for log correlation).
    pub connection_id: String,
    /// PCM sampling rate in Hz, constrained to 8000..=48000.
    pub sample_rate: u32,
    /// Optional language tag; the service default applies when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl SttConfig {
    /// Validates caller-supplied parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SttError::InvalidArgument`] for an empty session id or an
    /// out-of-range sampling rate.
    pub fn validate(&self) -> SttResult<()> {
        if self.session_id.is_empty() {
            return Err(SttError::InvalidArgument("session id must not be empty".into()));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(SttError::InvalidArgument(format!(
                "sampling rate {} out of range {}..={}",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }
        Ok(())
    }
}

/// Resolved per-session configuration (caller parameters merged with
/// service defaults).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// PCM sampling rate in Hz.
    pub sample_rate: u32,
    /// Language tag sent to the provider.
    pub language: String,
    /// Transcription model identifier.
    pub model: String,
}

impl SessionConfig {
    /// Merges caller parameters with service defaults.
    #[must_use]
    pub fn resolve(caller: &SttConfig, service: &ServiceConfig) -> Self {
        Self {
            sample_rate: caller.sample_rate,
            language: caller
                .language
                .clone()
                .unwrap_or_else(|| service.default_language.clone()),
            model: service.default_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller_config(sample_rate: u32) -> SttConfig {
        SttConfig {
            session_id: "sess-1".to_string(),
            connection_id: "conn-1".to_string(),
            sample_rate,
            language: None,
        }
    }

    #[test]
    fn default_config_is_sensible() {
        let config = ServiceConfig::default();
        assert!(config.api_key.is_none());
        assert!(!config.has_api_key());
        assert_eq!(config.default_sample_rate, 16_000);
        assert_eq!(config.default_language, "en-US");
        assert!(config.endpoint.starts_with("wss://"));
    }

    #[test]
    fn empty_api_key_is_not_healthy() {
        let config = ServiceConfig {
            api_key: Some(String::new()),
            ..Default::default()
        };
        assert!(!config.has_api_key());
    }

    #[test]
    fn validate_accepts_sample_rate_bounds() {
        assert!(caller_config(8_000).validate().is_ok());
        assert!(caller_config(16_000).validate().is_ok());
        assert!(caller_config(48_000).validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_sample_rate() {
        assert!(caller_config(7_999).validate().is_err());
        assert!(caller_config(48_001).validate().is_err());
        assert!(caller_config(0).validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_session_id() {
        let mut config = caller_config(16_000);
        config.session_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolve_applies_service_defaults() {
        let service = ServiceConfig::default();
        let resolved = SessionConfig::resolve(&caller_config(16_000), &service);
        assert_eq!(resolved.language, "en-US");
        assert_eq!(resolved.model, service.default_model);

        let mut caller = caller_config(16_000);
        caller.language = Some("de".to_string());
        let resolved = SessionConfig::resolve(&caller, &service);
        assert_eq!(resolved.language, "de");
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("TALKWIRE_STT_MODEL", "nova-2-general");
        std::env::set_var("TALKWIRE_STT_SAMPLE_RATE", "24000");
        let config = ServiceConfig::from_env();
        assert_eq!(config.default_model, "nova-2-general");
        assert_eq!(config.default_sample_rate, 24_000);
        std::env::remove_var("TALKWIRE_STT_MODEL");
        std::env::remove_var("TALKWIRE_STT_SAMPLE_RATE");
    }
}
