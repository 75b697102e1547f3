//! Wire-level helpers for the console REST API.
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Failure body: `{"error": "..."}`.
#[derive(Deserialize, Debug, Default)]
pub struct ApiError {
    #[serde(default)]
    pub error: Option<String>,
}

/// Extract the server-supplied error text from a failure body, if any.
pub fn server_error(body: &str) -> Option<String> {
    serde_json::from_str::<ApiError>(body)
        .ok()
        .and_then(|m| m.error)
        .filter(|e| !e.trim().is_empty())
}

/// Decode a list response. A body that is not an array decodes to nothing, and
/// elements that do not match `T` are dropped; neither is an error.
pub fn decode_list<T: DeserializeOwned>(value: Value, source: &str) -> Vec<T> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<T>(item) {
                Ok(v) => Some(v),
                Err(err) => {
                    warn!(source, %err, "skipping malformed element");
                    None
                }
            })
            .collect(),
        other => {
            warn!(source, kind = json_kind(&other), "expected an array; treating as empty");
            Vec::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnreadMessage;
    use serde_json::json;

    #[test]
    fn non_array_is_empty() {
        let out: Vec<UnreadMessage> = decode_list(json!({"error": "nope"}), "messages");
        assert!(out.is_empty());
        let out: Vec<UnreadMessage> = decode_list(Value::Null, "messages");
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_elements_dropped() {
        let out: Vec<UnreadMessage> = decode_list(
            json!([
                {"id": 1, "senderName": "Bob", "content": "hi", "eventId": 3},
                {"id": "x"},
                {"id": 2, "senderName": "Eve", "content": "yo", "eventId": 3, "timestamp": "2024-01-01T00:00:00"}
            ]),
            "messages",
        );
        assert_eq!(out.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn server_error_text() {
        assert_eq!(server_error(r#"{"error":"No template"}"#).as_deref(), Some("No template"));
        assert_eq!(server_error(r#"{"message":"ok"}"#), None);
        assert_eq!(server_error("<html>"), None);
    }
}
