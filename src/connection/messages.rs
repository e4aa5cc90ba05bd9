//! Message Types für Kontroll-Nachrichten
//!
//! Text-Frames auf dem Kanal sind JSON-Objekte mit einem `type`
//! Diskriminator. Binär-Frames sind Audio-Container und werden hier nicht
//! behandelt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Nicht verarbeitbare Kontroll-Nachricht (wird geloggt, nie weitergereicht)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Control message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Control message has no type")]
    MissingType,

    #[error("Unrecognized control message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} message: {message}")]
    InvalidPayload { kind: String, message: String },
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

const KNOWN_TYPES: [&str; 4] = ["tts_update", "tts_end", "asr_update", "asr_end"];

/// Alle bekannten Kontroll-Nachrichten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Text der synthetisierten Sprache
    TtsUpdate { tts: String },

    /// Synthese einer Antwort beendet
    TtsEnd,

    /// Text der erkannten Sprache
    AsrUpdate { asr: String },

    /// Finales Transkript einer Benutzer-Äußerung
    AsrEnd {
        #[serde(default)]
        asr: String,
    },
}

impl ControlMessage {
    /// Parst einen Text-Frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcript_updates() {
        assert_eq!(
            ControlMessage::parse(r#"{"type": "tts_update", "tts": "Hello there"}"#),
            Ok(ControlMessage::TtsUpdate {
                tts: "Hello there".to_string()
            })
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type": "asr_update", "asr": "what is my balance"}"#),
            Ok(ControlMessage::AsrUpdate {
                asr: "what is my balance".to_string()
            })
        );
    }

    #[test]
    fn test_parse_end_markers() {
        assert_eq!(
            ControlMessage::parse(r#"{"type": "tts_end"}"#),
            Ok(ControlMessage::TtsEnd)
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type": "asr_end", "asr": "done"}"#),
            Ok(ControlMessage::AsrEnd {
                asr: "done".to_string()
            })
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type": "asr_end"}"#),
            Ok(ControlMessage::AsrEnd { asr: String::new() })
        );
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"unknown_x"}"#),
            Err(ProtocolError::UnknownType("unknown_x".to_string()))
        );
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            ControlMessage::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            ControlMessage::parse(r#"{"tts": "x"}"#),
            Err(ProtocolError::MissingType)
        );
        assert!(matches!(
            ControlMessage::parse(r#"{"type": "tts_update"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_serialize_matches_wire_format() {
        let json = serde_json::to_value(ControlMessage::TtsUpdate {
            tts: "hi".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "tts_update", "tts": "hi"}));
    }
}
