use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, warn};

use crate::backend::{InsertAllRequest, InsertAllResponse, InsertRequestOptions, StreamingBackend};
use crate::error::{ErrorDetail, InsertError, PartialFailureError, PartialInsertFailure, Result};
use crate::metrics::Metrics;
use crate::pipeline::batch::Batch;
use crate::row::InsertRow;
use crate::table::TableRef;

/// Outcome shared by every row of one flush.
pub type FlushResult = std::result::Result<Arc<InsertAllResponse>, Arc<InsertError>>;

/// What a row's callback receives: the flush outcome plus the row's position
/// in the flushed batch.
#[derive(Debug, Clone)]
pub struct Delivery {
    index: usize,
    result: FlushResult,
}

impl Delivery {
    pub(crate) fn new(index: usize, result: FlushResult) -> Self {
        Self { index, result }
    }

    pub(crate) fn failed(index: usize, error: Arc<InsertError>) -> Self {
        Self::new(index, Err(error))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn result(&self) -> &FlushResult {
        &self.result
    }

    pub fn into_result(self) -> FlushResult {
        self.result
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The backend's rejection of this particular row, if any.
    pub fn failure(&self) -> Option<&PartialInsertFailure> {
        match &self.result {
            Err(err) => err.as_partial_failure()?.failure_at(self.index),
            Ok(_) => None,
        }
    }

    /// Errors the backend reported for this particular row, if any.
    pub fn row_errors(&self) -> Option<&[ErrorDetail]> {
        self.failure().map(|f| f.errors.as_slice())
    }
}

/// Terminal signal emitted once per flush.
#[derive(Debug, Clone)]
pub enum FlushEvent {
    Response {
        rows: usize,
        response: Arc<InsertAllResponse>,
    },
    Error {
        rows: usize,
        error: Arc<InsertError>,
    },
}

impl FlushEvent {
    pub fn rows(&self) -> usize {
        match self {
            FlushEvent::Response { rows, .. } | FlushEvent::Error { rows, .. } => *rows,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FlushEvent::Error { .. })
    }
}

/// Receives the stream-level signal of every flush.
pub trait FlushListener: Send + Sync {
    fn on_flush(&self, event: &FlushEvent);
}

pub struct NoopListener;

impl FlushListener for NoopListener {
    fn on_flush(&self, _event: &FlushEvent) {}
}

impl FlushListener for Sender<FlushEvent> {
    fn on_flush(&self, event: &FlushEvent) {
        // A dropped receiver just means nobody is watching any more.
        let _ = self.send(event.clone());
    }
}

/// Performs bulk writes against one table and decodes per-row failures.
pub struct InsertExecutor {
    backend: Arc<dyn StreamingBackend>,
    table: TableRef,
    options: InsertRequestOptions,
    metrics: Metrics,
}

impl InsertExecutor {
    pub fn new(
        backend: Arc<dyn StreamingBackend>,
        table: TableRef,
        options: InsertRequestOptions,
        metrics: Metrics,
    ) -> Self {
        Self {
            backend,
            table,
            options,
            metrics,
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Issues one bulk write with `rows` in order.
    ///
    /// Partial failures are correlated against `rows`, the exact array sent.
    pub fn execute(&self, rows: &[InsertRow]) -> Result<InsertAllResponse> {
        let bytes: usize = rows.iter().map(InsertRow::bytes).sum();
        self.metrics.inc_write_calls();
        self.metrics.add_bytes_sent(bytes as u64);

        let request = InsertAllRequest::new(rows, &self.options);
        let response = self
            .backend
            .insert_all(&self.table, &request)
            .map_err(InsertError::from_api)?;

        let outcome = decode_response(rows, response);
        let failed = match &outcome {
            Ok(_) => 0,
            Err(err) => err.as_partial_failure().map_or(rows.len(), |p| p.errors.len()),
        };
        self.metrics
            .add_rows_inserted(rows.len().saturating_sub(failed) as u64);
        outcome
    }

    /// Writes a flushed batch and fans the outcome out to every row callback,
    /// then to `listener`.
    pub fn flush(&self, batch: Batch, listener: &dyn FlushListener) {
        let (rows, callbacks) = batch.into_parts();
        let count = rows.len();

        let result: FlushResult = self.execute(&rows).map(Arc::new).map_err(Arc::new);
        let event = match &result {
            Ok(response) => {
                debug!("Flushed {} row(s) to {}", count, self.table);
                FlushEvent::Response {
                    rows: count,
                    response: Arc::clone(response),
                }
            }
            Err(error) => {
                let failed = error
                    .as_partial_failure()
                    .map_or(count, |p| p.errors.len());
                self.metrics.add_rows_failed(failed as u64);
                warn!(
                    "Flush of {} row(s) to {} failed: {}",
                    count, self.table, error
                );
                FlushEvent::Error {
                    rows: count,
                    error: Arc::clone(error),
                }
            }
        };

        for (index, callback) in callbacks.into_iter().enumerate() {
            callback(Delivery::new(index, result.clone()));
        }
        listener.on_flush(&event);
    }
}

/// Turns a successful call's `insertErrors` into a [`PartialFailureError`].
pub fn decode_response(rows: &[InsertRow], response: InsertAllResponse) -> Result<InsertAllResponse> {
    if response.insert_errors.is_empty() {
        return Ok(response);
    }

    let errors = response
        .insert_errors
        .iter()
        .map(|insert_error| PartialInsertFailure {
            index: insert_error.index,
            row: rows.get(insert_error.index).cloned(),
            errors: insert_error
                .errors
                .iter()
                .map(|e| ErrorDetail {
                    message: e.message.clone(),
                    reason: e.reason.clone(),
                })
                .collect(),
        })
        .collect();

    Err(InsertError::PartialFailure(PartialFailureError::new(errors, response)))
}
