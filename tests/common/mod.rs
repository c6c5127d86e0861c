#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use stream_insert::backend::{
    ErrorProto, InsertAllRequest, InsertAllResponse, InsertErrors, StreamingBackend,
};
use stream_insert::metrics::Metrics;
use stream_insert::pipeline::provision::Sleeper;
use stream_insert::{ApiError, InsertRow, Table, TableRef, TableSchema};

/// Backend that replays queued replies and records every call.
///
/// When a reply queue runs dry, inserts succeed and creates succeed.
#[derive(Default)]
pub struct ScriptedBackend {
    insert_replies: Mutex<VecDeque<Result<InsertAllResponse, ApiError>>>,
    create_replies: Mutex<VecDeque<Result<(), ApiError>>>,
    requests: Mutex<Vec<Vec<InsertRow>>>,
    creates: Mutex<Vec<(TableRef, TableSchema)>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, reply: Result<InsertAllResponse, ApiError>) -> &Self {
        self.insert_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn reply_create(&self, reply: Result<(), ApiError>) -> &Self {
        self.create_replies.lock().unwrap().push_back(reply);
        self
    }

    /// Rows of every insert call, in call order.
    pub fn requests(&self) -> Vec<Vec<InsertRow>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_sizes(&self) -> Vec<usize> {
        self.requests().iter().map(Vec::len).collect()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.lock().unwrap().len()
    }
}

impl StreamingBackend for ScriptedBackend {
    fn insert_all(
        &self,
        _table: &TableRef,
        request: &InsertAllRequest<'_>,
    ) -> Result<InsertAllResponse, ApiError> {
        self.requests.lock().unwrap().push(request.rows.to_vec());
        self.insert_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(InsertAllResponse::ok()))
    }

    fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), ApiError> {
        self.creates
            .lock()
            .unwrap()
            .push((table.clone(), schema.clone()));
        self.create_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

/// A response rejecting the rows at `indices` as invalid.
pub fn rejected(indices: &[usize]) -> Result<InsertAllResponse, ApiError> {
    Ok(InsertAllResponse::with_errors(
        indices
            .iter()
            .map(|&index| InsertErrors {
                index,
                errors: vec![ErrorProto::new("invalid", "bad value")],
            })
            .collect(),
    ))
}

pub fn missing_table() -> Result<InsertAllResponse, ApiError> {
    Err(ApiError::not_found("Not found: Table events.clicks"))
}

/// Sleeper that records requested waits instead of blocking.
pub fn recording_sleeper() -> (Arc<Sleeper>, Arc<Mutex<Vec<Duration>>>) {
    let waits = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&waits);
    let sleeper: Arc<Sleeper> = Arc::new(move |delay: Duration| recorded.lock().unwrap().push(delay));
    (sleeper, waits)
}

pub fn table_ref() -> TableRef {
    TableRef::new("events", "clicks")
}

pub fn table_on(backend: &Arc<ScriptedBackend>) -> Table {
    Table::new(table_ref(), backend.clone(), Metrics::new())
}

/// Scratch directory removed when dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}
