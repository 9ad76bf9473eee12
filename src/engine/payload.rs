//! Final-line result contract of a stage worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadStatus {
    Success,
    Error,
}

/// `{status, message, data?}`. Older workers put their fields beside
/// `status` instead of under `data`; [`StagePayload::field`] reads both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    pub status: PayloadStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StagePayload {
    pub fn is_success(&self) -> bool {
        self.status == PayloadStatus::Success
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data
            .as_ref()
            .and_then(|d| d.get(key))
            .or_else(|| self.extra.get(key))
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }
}

/// Parse one line as a payload with a recognised status.
pub(crate) fn parse_payload(line: &str) -> Option<StagePayload> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// The last candidate line that parses as a payload, scanning backward.
pub(crate) fn last_payload(candidates: &[String]) -> Option<StagePayload> {
    candidates.iter().rev().find_map(|line| parse_payload(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fields_from_data_or_top_level() {
        let nested = parse_payload(
            r#"{"status": "success", "message": "ok", "data": {"output_file": "a.db"}}"#,
        )
        .unwrap();
        assert_eq!(nested.str_field("output_file"), Some("a.db"));

        let flat = parse_payload(r#"{"status": "success", "output_file": "b.db"}"#).unwrap();
        assert!(flat.is_success());
        assert_eq!(flat.message, "");
        assert_eq!(flat.str_field("output_file"), Some("b.db"));
    }

    #[test]
    fn unrecognised_status_is_not_a_payload() {
        assert!(parse_payload(r#"{"status": "info", "message": "Reading sheet"}"#).is_none());
        assert!(parse_payload(r#"{"message": "no status"}"#).is_none());
        assert!(parse_payload("Year 2020").is_none());
        assert!(parse_payload("{not json").is_none());
    }

    #[test]
    fn scans_backward_past_log_lines() {
        let lines = vec![
            r#"{"status": "error", "message": "early"}"#.to_string(),
            r#"{"status": "success", "message": "final"}"#.to_string(),
            r#"{"status": "info", "message": "trailing log"}"#.to_string(),
            "plain text".to_string(),
        ];
        let payload = last_payload(&lines).unwrap();
        assert_eq!(payload.message, "final");
        assert!(last_payload(&lines[2..]).is_none());
    }
}
