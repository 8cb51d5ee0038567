//! Operation schema.
//!
//! Operations are JSON objects tagged by `type`:
//!
//! ```text
//! {"type":"add","value":{ListItem}}
//! {"type":"update","value":{ListItem}}
//! {"type":"delete","value":{ListItem}}
//! {"type":"list","value":[ListItem, ..]}
//! {"type":"add-writer","key":"<64 hex>"}
//! ```
//!
//! Any other `type` is carried as [`Operation::Unknown`].

use lista_log::WriterKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Why an operation payload was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("operation is not an object")]
    NotAnObject,
    #[error("missing operation type")]
    MissingType,
    #[error("field `{0}` is missing or has the wrong type")]
    Field(&'static str),
    #[error("list payload is not an array")]
    NotAnArray,
    #[error("invalid writer key")]
    InvalidKey,
}

/// One entry of the shared list. `text` is the dedupe key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    #[serde(default)]
    pub id: String,
    pub text: String,
    pub is_done: bool,
    #[serde(default)]
    pub list_id: Option<String>,
    pub time_of_completion: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub timestamp: i64,
}

impl ListItem {
    /// A fresh, not-done item with a random id.
    pub fn new(text: impl Into<String>, list_id: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id: generate_id(),
            text: text.into(),
            is_done: false,
            list_id,
            time_of_completion: 0,
            updated_at: now,
            timestamp: now,
        }
    }

    /// Parse and validate an item: `text` string, `isDone` bool and
    /// `timeOfCompletion` number are required; the rest default.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;
        let text = obj
            .get("text")
            .and_then(Value::as_str)
            .ok_or(SchemaError::Field("text"))?;
        let is_done = obj
            .get("isDone")
            .and_then(Value::as_bool)
            .ok_or(SchemaError::Field("isDone"))?;
        let time_of_completion = obj
            .get("timeOfCompletion")
            .and_then(as_millis)
            .ok_or(SchemaError::Field("timeOfCompletion"))?;
        Ok(Self::with_defaults(obj, text, is_done, time_of_completion))
    }

    /// Parse an item identified only by its `text` (delete payloads).
    pub fn from_value_lenient(value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;
        let text = obj
            .get("text")
            .and_then(Value::as_str)
            .ok_or(SchemaError::Field("text"))?;
        let is_done = obj.get("isDone").and_then(Value::as_bool).unwrap_or(false);
        let time_of_completion = obj.get("timeOfCompletion").and_then(as_millis).unwrap_or(0);
        Ok(Self::with_defaults(obj, text, is_done, time_of_completion))
    }

    fn with_defaults(
        obj: &Map<String, Value>,
        text: &str,
        is_done: bool,
        time_of_completion: i64,
    ) -> Self {
        Self {
            id: obj
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            text: text.to_string(),
            is_done,
            list_id: obj
                .get("listId")
                .and_then(Value::as_str)
                .map(str::to_string),
            time_of_completion,
            updated_at: obj.get("updatedAt").and_then(as_millis).unwrap_or(0),
            timestamp: obj.get("timestamp").and_then(as_millis).unwrap_or(0),
        }
    }
}

fn as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 16 random bytes, hex encoded.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A list operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add(ListItem),
    Update(ListItem),
    Delete(ListItem),
    List(Vec<ListItem>),
    AddWriter(WriterKey),
    /// Forward-compatible payload of an unknown type
    Unknown(Value),
}

impl Operation {
    /// Parse a log payload.
    pub fn parse(value: &Value) -> Result<Self, SchemaError> {
        let obj = value.as_object().ok_or(SchemaError::NotAnObject)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(SchemaError::MissingType)?;
        let payload = obj.get("value").unwrap_or(&Value::Null);

        match kind {
            "add" => Ok(Operation::Add(ListItem::from_value(payload)?)),
            "update" => Ok(Operation::Update(ListItem::from_value(payload)?)),
            "delete" => Ok(Operation::Delete(ListItem::from_value_lenient(payload)?)),
            "list" => {
                let items = payload.as_array().ok_or(SchemaError::NotAnArray)?;
                Ok(Operation::List(
                    items
                        .iter()
                        .filter_map(|item| ListItem::from_value(item).ok())
                        .collect(),
                ))
            }
            "add-writer" => {
                let key = obj
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or(SchemaError::Field("key"))?;
                let key = WriterKey::from_hex(key).map_err(|_| SchemaError::InvalidKey)?;
                Ok(Operation::AddWriter(key))
            }
            _ => Ok(Operation::Unknown(value.clone())),
        }
    }

    /// Encode for appending to the log.
    pub fn to_value(&self) -> Value {
        match self {
            Operation::Add(item) => json!({"type": "add", "value": item}),
            Operation::Update(item) => json!({"type": "update", "value": item}),
            Operation::Delete(item) => json!({"type": "delete", "value": item}),
            Operation::List(items) => json!({"type": "list", "value": items}),
            Operation::AddWriter(key) => json!({"type": "add-writer", "key": key.to_hex()}),
            Operation::Unknown(value) => value.clone(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Add(_) => "add",
            Operation::Update(_) => "update",
            Operation::Delete(_) => "delete",
            Operation::List(_) => "list",
            Operation::AddWriter(_) => "add-writer",
            Operation::Unknown(_) => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_defaults() {
        let item = ListItem::new("Milk", None);
        assert_eq!(item.text, "Milk");
        assert!(!item.is_done);
        assert_eq!(item.time_of_completion, 0);
        assert_eq!(item.id.len(), 32);
        assert_eq!(item.updated_at, item.timestamp);
    }

    #[test]
    fn item_uses_camel_case() {
        let value = serde_json::to_value(ListItem::new("Milk", None)).unwrap();
        assert!(value.get("isDone").is_some());
        assert!(value.get("timeOfCompletion").is_some());
        assert!(value.get("listId").is_some());
    }

    #[test]
    fn add_requires_schema() {
        let missing = json!({"type": "add", "value": {"text": "Milk", "isDone": false}});
        assert_eq!(
            Operation::parse(&missing),
            Err(SchemaError::Field("timeOfCompletion"))
        );

        let wrong = json!({"type": "add", "value": {"text": 5, "isDone": false, "timeOfCompletion": 0}});
        assert_eq!(Operation::parse(&wrong), Err(SchemaError::Field("text")));
    }

    #[test]
    fn float_timestamps_accepted() {
        let op = json!({"type": "update", "value": {"text": "Milk", "isDone": true, "timeOfCompletion": 1.7e12}});
        match Operation::parse(&op).unwrap() {
            Operation::Update(item) => assert_eq!(item.time_of_completion, 1_700_000_000_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn delete_needs_only_text() {
        let op = json!({"type": "delete", "value": {"text": "Milk"}});
        assert!(matches!(Operation::parse(&op), Ok(Operation::Delete(item)) if item.text == "Milk"));
    }

    #[test]
    fn list_must_be_array() {
        let op = json!({"type": "list", "value": {"text": "Milk"}});
        assert_eq!(Operation::parse(&op), Err(SchemaError::NotAnArray));
    }

    #[test]
    fn add_writer_roundtrip() {
        let key = WriterKey::from_bytes([3; 32]);
        let op = Operation::AddWriter(key);
        assert_eq!(Operation::parse(&op.to_value()), Ok(op));
    }

    #[test]
    fn unknown_types_preserved() {
        let value = json!({"type": "rename-list", "value": "Groceries"});
        assert_eq!(
            Operation::parse(&value),
            Ok(Operation::Unknown(value.clone()))
        );
    }
}
