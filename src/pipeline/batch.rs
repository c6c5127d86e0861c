use std::time::{Duration, Instant};

use crate::pipeline::executor::Delivery;
use crate::row::InsertRow;

/// Largest payload the backend accepts in one bulk write.
pub const MAX_BATCH_BYTES: usize = 9 * 1024 * 1024;
/// Most rows the backend accepts in one bulk write.
pub const MAX_BATCH_ROWS: usize = 50_000;

pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_ROWS: usize = 100;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10);

/// Completion callback registered for one row; fires exactly once.
pub type InsertCallback = Box<dyn FnOnce(Delivery) + Send + 'static>;

/// Effective batching limits: the user's ceiling clamped to the hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_bytes: usize,
    pub max_rows: usize,
    pub max_delay: Duration,
}

impl BatchLimits {
    pub fn new(max_bytes: usize, max_rows: usize, max_delay: Duration) -> Self {
        Self {
            max_bytes: max_bytes.min(MAX_BATCH_BYTES),
            max_rows: max_rows.clamp(1, MAX_BATCH_ROWS),
            max_delay,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES, DEFAULT_MAX_ROWS, DEFAULT_MAX_DELAY)
    }
}

/// Rows accumulated for a single bulk write, with one callback per row.
///
/// A batch is never reused after it is flushed; the queue installs a new one.
pub struct Batch {
    limits: BatchLimits,
    rows: Vec<InsertRow>,
    callbacks: Vec<InsertCallback>,
    bytes: usize,
    created: Instant,
}

impl Batch {
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            rows: Vec::new(),
            callbacks: Vec::new(),
            bytes: 0,
            created: Instant::now(),
        }
    }

    /// Appends without checking capacity; callers check `can_fit` first.
    pub fn add(&mut self, row: InsertRow, callback: InsertCallback) {
        self.bytes += row.bytes();
        self.rows.push(row);
        self.callbacks.push(callback);
    }

    pub fn can_fit(&self, row: &InsertRow) -> bool {
        self.rows.len() < self.limits.max_rows
            && self.bytes + row.bytes() <= self.limits.max_bytes
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.limits.max_rows || self.bytes >= self.limits.max_bytes
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn rows(&self) -> &[InsertRow] {
        &self.rows
    }

    pub fn into_parts(self) -> (Vec<InsertRow>, Vec<InsertCallback>) {
        (self.rows, self.callbacks)
    }
}
