//! Backend contract consumed by the insert engine.
//!
//! Transport, authentication and addressing live behind [`StreamingBackend`];
//! the engine only builds [`InsertAllRequest`]s and decodes
//! [`InsertAllResponse`]s.

pub mod local;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::row::InsertRow;
use crate::schema::TableSchema;
use crate::table::TableRef;

pub use local::LocalStore;

/// Bulk write and table creation against a tabular store.
pub trait StreamingBackend: Send + Sync {
    /// Writes all rows in one call. Per-row rejections come back inside the
    /// response; only transport-level failures are returned as `Err`.
    fn insert_all(
        &self,
        table: &TableRef,
        request: &InsertAllRequest<'_>,
    ) -> Result<InsertAllResponse, ApiError>;

    /// Creates the table. Must return a 409 error if it already exists.
    fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), ApiError>;
}

/// Options carried on every bulk write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRequestOptions {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip_invalid_rows: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_unknown_values: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_suffix: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllRequest<'a> {
    pub kind: &'static str,
    #[serde(flatten)]
    pub options: &'a InsertRequestOptions,
    pub rows: &'a [InsertRow],
}

impl<'a> InsertAllRequest<'a> {
    pub fn new(rows: &'a [InsertRow], options: &'a InsertRequestOptions) -> Self {
        Self {
            kind: "tableDataInsertAllRequest",
            options,
            rows,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertAllResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Rows that were not inserted, by index into the submitted array.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub insert_errors: Vec<InsertErrors>,
}

impl InsertAllResponse {
    pub fn ok() -> Self {
        Self {
            kind: Some("tableDataInsertAllResponse".to_string()),
            insert_errors: Vec::new(),
        }
    }

    pub fn with_errors(insert_errors: Vec<InsertErrors>) -> Self {
        Self {
            insert_errors,
            ..Self::ok()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertErrors {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorProto {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

impl ErrorProto {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            ..Self::default()
        }
    }
}
