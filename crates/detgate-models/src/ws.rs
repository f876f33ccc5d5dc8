//! Streaming channel wire messages.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{DetectionResult, ErrorKind};

/// Server to client message.
///
/// Serialized untagged so a result is `{"result": "...", "seq": 3}` and a
/// fatal error is `{"error": "...", "kind": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum StreamMessage {
    /// Detection result for an accepted frame
    Result {
        result: String,
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },

    /// Fatal session error, sent right before the session closes
    Error { error: String, kind: ErrorKind },
}

impl StreamMessage {
    pub fn result(seq: u64, detection: &DetectionResult) -> Self {
        Self::Result {
            result: detection.label.clone(),
            seq,
            confidence: detection.confidence_hint,
        }
    }

    pub fn error(kind: ErrorKind) -> Self {
        Self::Error {
            error: kind.public_message().to_string(),
            kind,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            StreamMessage::Result { .. } => "result",
            StreamMessage::Error { .. } => "error",
        }
    }
}

/// Client to server control message, sent as a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    /// Ask the server to close the session gracefully
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_message_shape() {
        let detection = DetectionResult::new("real");
        let json = serde_json::to_value(StreamMessage::result(7, &detection)).unwrap();
        assert_eq!(json, serde_json::json!({ "result": "real", "seq": 7 }));
    }

    #[test]
    fn test_error_message_shape() {
        let json = serde_json::to_value(StreamMessage::error(ErrorKind::LaunchFailed)).unwrap();
        assert_eq!(json["kind"], "launch_failed");
        assert_eq!(json["error"], "Failed to process file");
    }

    #[test]
    fn test_client_control_parse() {
        let control: ClientControl = serde_json::from_str(r#"{"type":"close"}"#).unwrap();
        assert_eq!(control, ClientControl::Close);
        assert!(serde_json::from_str::<ClientControl>(r#"{"type":"pause"}"#).is_err());
    }
}
