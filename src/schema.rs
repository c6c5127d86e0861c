use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InsertError;

/// Column type of a destination field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Bytes,
    #[serde(alias = "INT64")]
    Integer,
    #[serde(alias = "FLOAT64")]
    Float,
    Numeric,
    #[serde(alias = "BOOL")]
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Json,
    #[serde(alias = "STRUCT")]
    Record,
}

impl FromStr for FieldType {
    type Err = InsertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => FieldType::String,
            "BYTES" => FieldType::Bytes,
            "INTEGER" | "INT64" => FieldType::Integer,
            "FLOAT" | "FLOAT64" => FieldType::Float,
            "NUMERIC" => FieldType::Numeric,
            "BOOLEAN" | "BOOL" => FieldType::Boolean,
            "TIMESTAMP" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "TIME" => FieldType::Time,
            "DATETIME" => FieldType::Datetime,
            "JSON" => FieldType::Json,
            "RECORD" | "STRUCT" => FieldType::Record,
            other => {
                return Err(InsertError::InvalidSchema(format!(
                    "unknown field type '{other}'"
                )))
            }
        };
        Ok(ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSchema>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
            fields: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_fields(mut self, fields: Vec<FieldSchema>) -> Self {
        self.fields = fields;
        self
    }
}

/// Schema used when a missing destination is created on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }.normalized()
    }

    /// Any field carrying nested fields is a RECORD, whatever type it declared.
    pub fn normalized(mut self) -> Self {
        fn normalize(fields: &mut [FieldSchema]) {
            for field in fields {
                if !field.fields.is_empty() {
                    field.field_type = FieldType::Record;
                    normalize(&mut field.fields);
                }
            }
        }
        normalize(&mut self.fields);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Parses the compact `"name:type, other:type"` form. A missing type means STRING.
impl FromStr for TableSchema {
    type Err = InsertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::new();
        for pair in s.split(',') {
            let mut parts = pair.splitn(2, ':');
            let name = parts.next().unwrap_or_default().trim();
            if name.is_empty() {
                return Err(InsertError::InvalidSchema(format!(
                    "empty field name in '{s}'"
                )));
            }
            let field_type = match parts.next() {
                Some(ty) if !ty.trim().is_empty() => ty.parse()?,
                _ => FieldType::String,
            };
            fields.push(FieldSchema::new(name, field_type));
        }
        Ok(TableSchema::new(fields))
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|field| {
                let ty = serde_json::to_value(field.field_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                format!("{}:{}", field.name, ty)
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_schema_string() {
        let schema: TableSchema = "id:integer, name , score:float64".parse().unwrap();
        assert_eq!(schema.fields.len(), 3);
        assert_eq!(schema.fields[0].field_type, FieldType::Integer);
        assert_eq!(schema.fields[1].name, "name");
        assert_eq!(schema.fields[1].field_type, FieldType::String);
        assert_eq!(schema.fields[2].field_type, FieldType::Float);
        assert_eq!(schema.to_string(), "id:INTEGER,name:STRING,score:FLOAT");
    }

    #[test]
    fn rejects_unknown_types() {
        assert!("id:uuid".parse::<TableSchema>().is_err());
        assert!(":integer".parse::<TableSchema>().is_err());
    }

    #[test]
    fn nested_fields_become_records() {
        let schema = TableSchema::new(vec![FieldSchema::new("address", FieldType::String)
            .with_fields(vec![FieldSchema::new("city", FieldType::String)])]);
        assert_eq!(schema.fields[0].field_type, FieldType::Record);
    }

    #[test]
    fn deserializes_api_shape() {
        let schema: TableSchema = serde_json::from_str(
            r#"{"fields":[{"name":"id","type":"INTEGER","mode":"REQUIRED"},{"name":"tags","type":"STRING","mode":"REPEATED"}]}"#,
        )
        .unwrap();
        assert_eq!(schema.field("id").unwrap().mode, FieldMode::Required);
        assert_eq!(schema.field("tags").unwrap().mode, FieldMode::Repeated);
    }
}
