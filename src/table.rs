use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::backend::{InsertAllResponse, InsertRequestOptions, StreamingBackend};
use crate::error::{InsertError, Result};
use crate::metrics::Metrics;
use crate::pipeline::executor::{FlushListener, InsertExecutor};
use crate::pipeline::provision::{AutoProvisioner, ProvisionPolicy, Sleeper};
use crate::pipeline::queue::{InsertQueue, QueueOptions};
use crate::pipeline::retry::{RetryCoordinator, DEFAULT_PARTIAL_RETRIES};
use crate::row::InsertRow;
use crate::schema::TableSchema;

/// Address of a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

impl FromStr for TableRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((dataset, table)) if !dataset.is_empty() && !table.is_empty() => {
                Ok(TableRef::new(dataset, table))
            }
            _ => Err(format!("expected <dataset>.<table>, got '{s}'")),
        }
    }
}

/// Options for the one-shot insert path.
#[derive(Debug, Clone)]
pub struct InsertRowsOptions {
    /// Extra attempts for rows rejected in a partial failure.
    pub partial_retries: u32,
    pub create_insert_id: bool,
    /// Create the table with this schema if it does not exist.
    pub schema: Option<TableSchema>,
    pub request: InsertRequestOptions,
}

impl Default for InsertRowsOptions {
    fn default() -> Self {
        Self {
            partial_retries: DEFAULT_PARTIAL_RETRIES,
            create_insert_id: true,
            schema: None,
            request: InsertRequestOptions::default(),
        }
    }
}

/// Entry point for writing rows to one table.
pub struct Table {
    reference: TableRef,
    backend: Arc<dyn StreamingBackend>,
    metrics: Metrics,
    provision: ProvisionPolicy,
    sleep: Arc<Sleeper>,
}

impl Table {
    pub fn new(reference: TableRef, backend: Arc<dyn StreamingBackend>, metrics: Metrics) -> Self {
        Self {
            reference,
            backend,
            metrics,
            provision: ProvisionPolicy::default(),
            sleep: Arc::new(thread::sleep),
        }
    }

    pub fn with_provision_policy(mut self, policy: ProvisionPolicy) -> Self {
        self.provision = policy;
        self
    }

    /// Replaces the blocking wait used between provisioning rounds.
    pub fn with_sleeper(mut self, sleep: Arc<Sleeper>) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn reference(&self) -> &TableRef {
        &self.reference
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Encodes `rows` and inserts them, retrying partial failures and creating
    /// the table when a schema is given.
    pub fn insert<T: Serialize>(
        &self,
        rows: &[T],
        options: &InsertRowsOptions,
    ) -> Result<InsertAllResponse> {
        let encoded = rows
            .iter()
            .map(|row| InsertRow::encode(row, options.create_insert_id))
            .collect::<Result<Vec<_>>>()?;
        self.insert_raw(encoded, options)
    }

    /// Inserts pre-encoded rows as given, keeping their insert ids.
    pub fn insert_raw(
        &self,
        rows: Vec<InsertRow>,
        options: &InsertRowsOptions,
    ) -> Result<InsertAllResponse> {
        if rows.is_empty() {
            return Err(InsertError::NoRows);
        }
        self.metrics.add_rows_enqueued(rows.len() as u64);

        let executor = self.executor(options.request.clone());
        let retry = RetryCoordinator::new(&executor, options.partial_retries, &self.metrics);

        // Every restart resubmits the full original set with the same ids.
        let attempt = || retry.run(rows.clone());
        let result = match &options.schema {
            Some(schema) => AutoProvisioner::new(
                self.backend.as_ref(),
                &self.reference,
                schema,
                &self.provision,
                &self.metrics,
                self.sleep.as_ref(),
            )
            .run(attempt),
            None => attempt(),
        };

        if let Err(err) = &result {
            let failed = err
                .as_partial_failure()
                .map_or(rows.len(), |p| p.errors.len());
            self.metrics.add_rows_failed(failed as u64);
        }
        result
    }

    /// Starts a continuous batching queue for this table.
    pub fn insert_queue(
        &self,
        options: QueueOptions,
        request: InsertRequestOptions,
        listener: Arc<dyn FlushListener>,
    ) -> InsertQueue {
        InsertQueue::new(self.executor(request), options, listener, self.metrics.clone())
    }

    fn executor(&self, request: InsertRequestOptions) -> InsertExecutor {
        InsertExecutor::new(
            Arc::clone(&self.backend),
            self.reference.clone(),
            request,
            self.metrics.clone(),
        )
    }
}
