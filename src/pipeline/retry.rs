use log::warn;

use crate::backend::InsertAllResponse;
use crate::error::{InsertError, Result};
use crate::metrics::Metrics;
use crate::pipeline::executor::InsertExecutor;
use crate::row::InsertRow;

pub const DEFAULT_PARTIAL_RETRIES: u32 = 3;

/// Retries a one-shot insert, resubmitting only the rows that failed.
pub struct RetryCoordinator<'a> {
    executor: &'a InsertExecutor,
    max_attempts: u32,
    metrics: &'a Metrics,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(executor: &'a InsertExecutor, partial_retries: u32, metrics: &'a Metrics) -> Self {
        Self {
            executor,
            max_attempts: partial_retries.saturating_add(1),
            metrics,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Runs up to `max_attempts` bulk writes. Any error other than a partial
    /// failure ends the cycle immediately, as does a partial failure with no
    /// identifiable rows.
    pub fn run(&self, rows: Vec<InsertRow>) -> Result<InsertAllResponse> {
        let mut rows = rows;
        let mut attempt = 1;
        loop {
            let err = match self.executor.execute(&rows) {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let failed = match &err {
                InsertError::PartialFailure(partial) => partial.failed_rows(),
                _ => return Err(err),
            };
            if failed.is_empty() || attempt >= self.max_attempts {
                return Err(err);
            }

            warn!(
                "Attempt {}/{} on {}: {} of {} row(s) rejected, retrying them",
                attempt,
                self.max_attempts,
                self.executor.table(),
                failed.len(),
                rows.len()
            );
            self.metrics.inc_partial_retries();
            rows = failed;
            attempt += 1;
        }
    }
}
