//! Encoded rows and their insert ids.
//!
//! A row's byte footprint is computed once, when it is encoded, and never
//! recomputed while the row sits in a batch or is retried.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{InsertError, Result};

/// One row as it travels on the wire: `{"insertId": ..., "json": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawInsertRow")]
pub struct InsertRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    insert_id: Option<String>,
    json: Map<String, Value>,
    #[serde(skip)]
    bytes: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInsertRow {
    #[serde(default)]
    insert_id: Option<String>,
    json: Map<String, Value>,
}

impl TryFrom<RawInsertRow> for InsertRow {
    type Error = InsertError;

    fn try_from(raw: RawInsertRow) -> Result<Self> {
        InsertRow::new(raw.json, raw.insert_id)
    }
}

impl InsertRow {
    pub fn new(json: Map<String, Value>, insert_id: Option<String>) -> Result<Self> {
        let mut row = Self {
            insert_id,
            json,
            bytes: 0,
        };
        row.bytes = size_of(&row)?;
        Ok(row)
    }

    /// Encodes a caller value, attaching a fresh insert id when `create_insert_id` is set.
    pub fn encode<T: Serialize + ?Sized>(value: &T, create_insert_id: bool) -> Result<Self> {
        let json = encode_value(value)?;
        let insert_id = create_insert_id.then(generate_insert_id);
        Self::new(json, insert_id)
    }

    pub fn insert_id(&self) -> Option<&str> {
        self.insert_id.as_deref()
    }

    pub fn json(&self) -> &Map<String, Value> {
        &self.json
    }

    /// UTF-8 length of the canonical encoded form.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Encodes a caller value into the JSON object sent for a row.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(InsertError::NotAnObject),
    }
}

/// Byte length of the serialized row.
pub fn size_of(row: &InsertRow) -> Result<usize> {
    Ok(serde_json::to_vec(row)?.len())
}

pub fn generate_insert_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn size_matches_serialized_length() {
        let row = InsertRow::encode(&json!({"name": "ünïcode", "n": 3}), false).unwrap();
        let wire = serde_json::to_string(&row).unwrap();
        assert_eq!(row.bytes(), wire.len());
        assert!(!wire.contains("insertId"));
    }

    #[test]
    fn encode_attaches_insert_id_unless_suppressed() {
        let with_id = InsertRow::encode(&json!({"a": 1}), true).unwrap();
        let without_id = InsertRow::encode(&json!({"a": 1}), false).unwrap();
        assert_eq!(with_id.insert_id().map(str::len), Some(36));
        assert!(without_id.insert_id().is_none());
        assert!(with_id.bytes() > without_id.bytes());
    }

    #[test]
    fn rejects_non_object_rows() {
        let err = InsertRow::encode(&json!([1, 2, 3]), true).unwrap_err();
        assert!(matches!(err, InsertError::NotAnObject));
    }

    #[test]
    fn deserialized_raw_rows_carry_their_size() {
        let row: InsertRow =
            serde_json::from_str(r#"{"insertId":"abc","json":{"x":true}}"#).unwrap();
        assert_eq!(row.insert_id(), Some("abc"));
        assert_eq!(row.bytes(), serde_json::to_vec(&row).unwrap().len());
    }
}
