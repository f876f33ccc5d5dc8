//! Normalized detection results.
//!
//! Detection engines answer with one JSON object. Different engines name
//! the label field differently (`label`, `result`, `message`), so parsing
//! normalizes them into a single [`DetectionResult`].

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field names accepted as the detection label, in priority order.
const LABEL_FIELDS: &[&str] = &["label", "result", "message"];

/// Field names accepted as a numeric confidence, in priority order.
const CONFIDENCE_FIELDS: &[&str] = &["confidence", "score"];

/// Errors produced while normalizing engine output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutputError {
    #[error("engine produced no output")]
    Empty,

    #[error("output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("output is not a JSON object")]
    NotAnObject,

    #[error("engine reported an error: {0}")]
    Reported(String),

    #[error("output has no label field")]
    MissingLabel,
}

/// Normalized result of one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionResult {
    /// Human readable label produced by the engine
    pub label: String,
    /// Raw engine output (trimmed)
    pub raw: String,
    /// Confidence reported by the engine, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_hint: Option<f64>,
}

impl DetectionResult {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            raw: serde_json::json!({ "label": label }).to_string(),
            label,
            confidence_hint: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_hint = Some(confidence);
        self
    }

    /// Parse the structured output of a detection engine.
    pub fn parse(output: &str) -> Result<Self, OutputError> {
        let raw = output.trim();
        if raw.is_empty() {
            return Err(OutputError::Empty);
        }

        let value: Value =
            serde_json::from_str(raw).map_err(|e| OutputError::InvalidJson(e.to_string()))?;
        let object = value.as_object().ok_or(OutputError::NotAnObject)?;

        match string_field(object, LABEL_FIELDS) {
            Some(label) => Ok(Self {
                label: label.to_string(),
                raw: raw.to_string(),
                confidence_hint: number_field(object, CONFIDENCE_FIELDS),
            }),
            None => match object.get("error").and_then(Value::as_str) {
                Some(reported) => Err(OutputError::Reported(reported.to_string())),
                None => Err(OutputError::MissingLabel),
            },
        }
    }

    /// Classify this result. See [`Verdict::classify`].
    pub fn verdict(&self) -> Verdict {
        Verdict::classify(self)
    }
}

fn string_field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| object.get(*name).and_then(Value::as_str))
}

fn number_field(object: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    names
        .iter()
        .find_map(|name| object.get(*name).and_then(Value::as_f64))
}

/// Coarse classification of a detection label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Content looks machine generated
    Synthetic,
    /// Content looks authentic
    Authentic,
    /// Label did not match any known vocabulary
    #[default]
    Unknown,
}

const SYNTHETIC_WORDS: &[&str] = &[
    "ai",
    "artificial",
    "synthetic",
    "generated",
    "fake",
    "deepfake",
];

const AUTHENTIC_WORDS: &[&str] = &["real", "human", "authentic", "genuine", "natural"];

impl Verdict {
    /// Classify a result by whole-word match on its label.
    ///
    /// Synthetic words take precedence, so "not real, AI generated" is
    /// synthetic. Substrings never match: "said" does not contain the word
    /// "ai".
    pub fn classify(result: &DetectionResult) -> Self {
        let words: Vec<String> = result
            .label
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let has_any = |vocab: &[&str]| words.iter().any(|w| vocab.contains(&w.as_str()));

        if has_any(SYNTHETIC_WORDS) {
            Verdict::Synthetic
        } else if has_any(AUTHENTIC_WORDS) {
            Verdict::Authentic
        } else {
            Verdict::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Synthetic => "synthetic",
            Verdict::Authentic => "authentic",
            Verdict::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_field() {
        let result = DetectionResult::parse("{\"label\":\"real\"}\n").unwrap();
        assert_eq!(result.label, "real");
        assert_eq!(result.raw, "{\"label\":\"real\"}");
        assert_eq!(result.confidence_hint, None);
    }

    #[test]
    fn test_parse_result_field_with_confidence() {
        let result =
            DetectionResult::parse(r#"{"result": "Example detection", "confidence": 0.95}"#)
                .unwrap();
        assert_eq!(result.label, "Example detection");
        assert_eq!(result.confidence_hint, Some(0.95));
    }

    #[test]
    fn test_parse_message_field() {
        let result = DetectionResult::parse(r#"{"message": "AI generated", "score": 1}"#).unwrap();
        assert_eq!(result.label, "AI generated");
        assert_eq!(result.confidence_hint, Some(1.0));
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(DetectionResult::parse("   \n"), Err(OutputError::Empty));
        assert!(matches!(
            DetectionResult::parse("Traceback (most recent call last)"),
            Err(OutputError::InvalidJson(_))
        ));
        assert_eq!(DetectionResult::parse("[1, 2]"), Err(OutputError::NotAnObject));
        assert_eq!(DetectionResult::parse("{\"label\": 3}"), Err(OutputError::MissingLabel));
        assert_eq!(
            DetectionResult::parse("{\"error\": \"cannot identify image file\"}"),
            Err(OutputError::Reported("cannot identify image file".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_trailing_lines() {
        assert!(matches!(
            DetectionResult::parse("{\"label\":\"real\"}\n{\"label\":\"fake\"}"),
            Err(OutputError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_verdict_classification() {
        assert_eq!(DetectionResult::new("AI Generated").verdict(), Verdict::Synthetic);
        assert_eq!(DetectionResult::new("artificial").verdict(), Verdict::Synthetic);
        assert_eq!(DetectionResult::new("real").verdict(), Verdict::Authentic);
        assert_eq!(DetectionResult::new("Human-made photo").verdict(), Verdict::Authentic);
        assert_eq!(DetectionResult::new("Example detection").verdict(), Verdict::Unknown);
    }

    #[test]
    fn test_verdict_ignores_substrings() {
        // "said" and "mountain" contain "ai" but are not the word "ai".
        assert_eq!(DetectionResult::new("he said mountain").verdict(), Verdict::Unknown);
    }

    #[test]
    fn test_verdict_synthetic_wins() {
        assert_eq!(DetectionResult::new("not real: AI").verdict(), Verdict::Synthetic);
    }
}
