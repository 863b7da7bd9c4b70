//! Semantic events produced by the upstream transcription provider.
//!
//! The raw socket traffic is normalized into one tagged enum that a
//! per-session dispatch task consumes. Keeping the event surface closed
//! makes the handler fault boundary structural: one `match`, one arm per
//! event, each arm isolated.

use serde_json::Value;

use super::classify::UpstreamFailure;

/// One semantic event from the upstream provider.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The connection reached the open state.
    Open,
    /// A transcript fragment (interim or final) for the current stream.
    Transcript {
        /// Text of the first alternative.
        text: String,
        /// Provider confidence in `[0, 1]`.
        confidence: f64,
        /// Whether the fragment is final.
        is_final: bool,
    },
    /// End-of-stream acknowledgement; resolves a pending finalization.
    Metadata,
    /// The provider detected the start of speech.
    SpeechStarted,
    /// The provider detected the end of an utterance.
    UtteranceEnd,
    /// The connection closed, expectedly or not.
    Close {
        /// WebSocket close code (1005 when absent, 1006 when torn).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
    /// The provider or socket reported an error.
    Error(UpstreamFailure),
}

/// Parses one provider text frame into a semantic event.
///
/// Returns `None` for frames that carry nothing actionable (unknown types,
/// results without a transcript, empty transcripts).
#[must_use]
pub fn parse_provider_message(text: &str) -> Option<UpstreamEvent> {
    let json: Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(e) => {
            log::warn!("[Upstream] unparseable provider frame: {e}");
            return None;
        }
    };

    match json["type"].as_str() {
        Some("Results") => parse_results(&json),
        Some("Metadata") => Some(UpstreamEvent::Metadata),
        Some("SpeechStarted") => Some(UpstreamEvent::SpeechStarted),
        Some("UtteranceEnd") => Some(UpstreamEvent::UtteranceEnd),
        Some("Error") => Some(UpstreamEvent::Error(parse_error(&json))),
        Some(other) => {
            tracing::debug!(kind = other, "ignoring provider frame");
            None
        }
        None => {
            log::warn!("[Upstream] provider frame without a type field");
            None
        }
    }
}

/// Extracts the first alternative of a `Results` frame.
fn parse_results(json: &Value) -> Option<UpstreamEvent> {
    let is_final = json["is_final"].as_bool().unwrap_or(false);
    let first_alt = json
        .get("channel")?
        .get("alternatives")?
        .as_array()?
        .first()?;

    let text = first_alt["transcript"].as_str().unwrap_or("");
    if text.is_empty() {
        return None;
    }

    Some(UpstreamEvent::Transcript {
        text: text.to_string(),
        confidence: first_alt["confidence"].as_f64().unwrap_or(0.0),
        is_final,
    })
}

/// Extracts message and numeric code from a provider `Error` frame.
fn parse_error(json: &Value) -> UpstreamFailure {
    let message = json
        .get("err_msg")
        .or_else(|| json.get("description"))
        .and_then(Value::as_str)
        .unwrap_or("provider error")
        .to_string();
    let code = json
        .get("err_code")
        .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
        .and_then(|c| u16::try_from(c).ok());

    UpstreamFailure {
        message,
        status: None,
        code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interim_results() {
        let frame = r#"{
            "type": "Results",
            "is_final": false,
            "channel": { "alternatives": [ { "transcript": "hello wor", "confidence": 0.82 } ] }
        }"#;
        assert_eq!(
            parse_provider_message(frame),
            Some(UpstreamEvent::Transcript {
                text: "hello wor".to_string(),
                confidence: 0.82,
                is_final: false,
            })
        );
    }

    #[test]
    fn parses_final_results() {
        let frame = r#"{
            "type": "Results",
            "is_final": true,
            "channel": { "alternatives": [ { "transcript": "hello world", "confidence": 0.97 } ] }
        }"#;
        match parse_provider_message(frame) {
            Some(UpstreamEvent::Transcript { text, is_final, .. }) => {
                assert_eq!(text, "hello world");
                assert!(is_final);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn empty_transcript_is_dropped() {
        let frame = r#"{
            "type": "Results",
            "is_final": false,
            "channel": { "alternatives": [ { "transcript": "" } ] }
        }"#;
        assert_eq!(parse_provider_message(frame), None);
    }

    #[test]
    fn only_first_alternative_is_used() {
        let frame = r#"{
            "type": "Results",
            "is_final": true,
            "channel": { "alternatives": [
                { "transcript": "first", "confidence": 0.9 },
                { "transcript": "second", "confidence": 0.8 }
            ] }
        }"#;
        match parse_provider_message(frame) {
            Some(UpstreamEvent::Transcript { text, .. }) => assert_eq!(text, "first"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_metadata_and_vad_markers() {
        assert_eq!(
            parse_provider_message(r#"{"type":"Metadata","request_id":"abc"}"#),
            Some(UpstreamEvent::Metadata)
        );
        assert_eq!(
            parse_provider_message(r#"{"type":"SpeechStarted"}"#),
            Some(UpstreamEvent::SpeechStarted)
        );
        assert_eq!(
            parse_provider_message(r#"{"type":"UtteranceEnd"}"#),
            Some(UpstreamEvent::UtteranceEnd)
        );
    }

    #[test]
    fn parses_error_frame() {
        let frame = r#"{"type":"Error","err_code":"429","err_msg":"too many streams"}"#;
        match parse_provider_message(frame) {
            Some(UpstreamEvent::Error(failure)) => {
                assert_eq!(failure.message, "too many streams");
                assert_eq!(failure.code, Some(429));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_and_malformed_frames_are_ignored() {
        assert_eq!(parse_provider_message(r#"{"type":"Warning"}"#), None);
        assert_eq!(parse_provider_message(r#"{"no_type":true}"#), None);
        assert_eq!(parse_provider_message("not json"), None);
    }
}
