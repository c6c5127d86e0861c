use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::backend::InsertAllResponse;
use crate::row::InsertRow;

/// Error returned by a backend call, carrying the HTTP-class status code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }
}

/// One `{message, reason}` pair reported for a rejected row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
    pub reason: String,
}

/// A rejected row, correlated back to the row that was submitted at `index`.
///
/// `row` is `None` only when the backend reported an index outside the
/// submitted array.
#[derive(Debug, Clone)]
pub struct PartialInsertFailure {
    pub index: usize,
    pub row: Option<InsertRow>,
    pub errors: Vec<ErrorDetail>,
}

/// Aggregate error for a bulk write where the call succeeded but some rows
/// were rejected.
#[derive(Debug, Clone)]
pub struct PartialFailureError {
    pub errors: Vec<PartialInsertFailure>,
    pub response: InsertAllResponse,
    /// Submitted index to position in `errors`; the first report wins.
    by_index: HashMap<usize, usize>,
}

impl PartialFailureError {
    pub fn new(errors: Vec<PartialInsertFailure>, response: InsertAllResponse) -> Self {
        let mut by_index = HashMap::with_capacity(errors.len());
        for (pos, failure) in errors.iter().enumerate() {
            by_index.entry(failure.index).or_insert(pos);
        }
        Self {
            errors,
            response,
            by_index,
        }
    }

    /// Rows that can be resubmitted, in the order the backend reported them.
    pub fn failed_rows(&self) -> Vec<InsertRow> {
        self.errors.iter().filter_map(|f| f.row.clone()).collect()
    }

    /// The failure reported for the row at `index` of the submitted array.
    pub fn failure_at(&self, index: usize) -> Option<&PartialInsertFailure> {
        self.by_index.get(&index).and_then(|&pos| self.errors.get(pos))
    }

    /// Errors reported for the row at `index` of the submitted array.
    pub fn errors_at(&self, index: usize) -> Option<&[ErrorDetail]> {
        self.failure_at(index).map(|f| f.errors.as_slice())
    }
}

impl fmt::Display for PartialFailureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} row(s) failed to insert", self.errors.len())?;
        if let Some(first) = self.errors.first().and_then(|e| e.errors.first()) {
            write!(f, " (first: {}: {})", first.reason, first.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialFailureError {}

#[derive(Error, Debug)]
pub enum InsertError {
    #[error("transport error: {0}")]
    Transport(ApiError),

    #[error("not found: {0}")]
    NotFound(ApiError),

    #[error("already exists: {0}")]
    AlreadyExists(ApiError),

    #[error("partial failure: {0}")]
    PartialFailure(PartialFailureError),

    #[error("You must provide at least 1 row to be inserted.")]
    NoRows,

    #[error("row of {bytes} bytes exceeds the batch limit of {max} bytes")]
    RowTooLarge { bytes: usize, max: usize },

    #[error("insert queue is closed")]
    QueueClosed,

    #[error("row must encode to a JSON object")]
    NotAnObject,

    #[error("malformed row on line {line}: {source}")]
    MalformedLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("table {table} still not visible after {attempts} provisioning attempt(s)")]
    DestinationNotVisible { table: String, attempts: u32 },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InsertError {
    /// Classifies a backend error by status code.
    pub fn from_api(err: ApiError) -> Self {
        match err.code {
            404 => InsertError::NotFound(err),
            409 => InsertError::AlreadyExists(err),
            _ => InsertError::Transport(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, InsertError::NotFound(_))
    }

    pub fn as_partial_failure(&self) -> Option<&PartialFailureError> {
        match self {
            InsertError::PartialFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApiError> for InsertError {
    fn from(err: ApiError) -> Self {
        InsertError::from_api(err)
    }
}

pub type Result<T> = std::result::Result<T, InsertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_api_errors_by_code() {
        assert!(matches!(
            InsertError::from_api(ApiError::not_found("Not found: Table d.t")),
            InsertError::NotFound(_)
        ));
        assert!(matches!(
            InsertError::from_api(ApiError::already_exists("Already Exists: Table d.t")),
            InsertError::AlreadyExists(_)
        ));
        assert!(matches!(
            InsertError::from_api(ApiError::new(503, "backend unavailable")),
            InsertError::Transport(_)
        ));
    }

    #[test]
    fn partial_failure_display_names_first_reason() {
        let err = PartialFailureError::new(
            vec![PartialInsertFailure {
                index: 0,
                row: None,
                errors: vec![ErrorDetail {
                    message: "bad value".to_string(),
                    reason: "invalid".to_string(),
                }],
            }],
            InsertAllResponse::default(),
        );
        let text = err.to_string();
        assert!(text.contains("1 row(s)"));
        assert!(text.contains("invalid: bad value"));
    }

    #[test]
    fn failure_lookup_by_index_ignores_report_order() {
        let failure = |index: usize, reason: &str| PartialInsertFailure {
            index,
            row: None,
            errors: vec![ErrorDetail {
                message: String::new(),
                reason: reason.to_string(),
            }],
        };
        let err = PartialFailureError::new(
            vec![
                failure(40_000, "stopped"),
                failure(7, "invalid"),
                failure(7, "duplicate"),
            ],
            InsertAllResponse::default(),
        );

        assert_eq!(err.errors_at(7).unwrap()[0].reason, "invalid");
        assert_eq!(err.failure_at(40_000).unwrap().errors[0].reason, "stopped");
        assert!(err.failure_at(8).is_none());
    }
}
