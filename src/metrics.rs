use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Run-wide counters, cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,
    rows_enqueued: AtomicU64,
    rows_inserted: AtomicU64,
    rows_failed: AtomicU64,
    batches_flushed: AtomicU64,
    write_calls: AtomicU64,
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    partial_retries: AtomicU64,
    tables_created: AtomicU64,
    provision_waits: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                rows_enqueued: AtomicU64::new(0),
                rows_inserted: AtomicU64::new(0),
                rows_failed: AtomicU64::new(0),
                batches_flushed: AtomicU64::new(0),
                write_calls: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                partial_retries: AtomicU64::new(0),
                tables_created: AtomicU64::new(0),
                provision_waits: AtomicU64::new(0),
            }),
        }
    }

    pub fn inc_rows_enqueued(&self) {
        self.add_rows_enqueued(1);
    }

    pub fn add_rows_enqueued(&self, count: u64) {
        self.inner.rows_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rows_inserted(&self, count: u64) {
        self.inner.rows_inserted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_rows_failed(&self, count: u64) {
        self.inner.rows_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.inner.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_write_calls(&self) {
        self.inner.write_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.inner.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.inner.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_partial_retries(&self) {
        self.inner.partial_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tables_created(&self) {
        self.inner.tables_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_provision_waits(&self) {
        self.inner.provision_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rows_enqueued(&self) -> u64 {
        self.inner.rows_enqueued.load(Ordering::Relaxed)
    }

    pub fn rows_inserted(&self) -> u64 {
        self.inner.rows_inserted.load(Ordering::Relaxed)
    }

    pub fn rows_failed(&self) -> u64 {
        self.inner.rows_failed.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.inner.batches_flushed.load(Ordering::Relaxed)
    }

    pub fn write_calls(&self) -> u64 {
        self.inner.write_calls.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn partial_retries(&self) -> u64 {
        self.inner.partial_retries.load(Ordering::Relaxed)
    }

    pub fn tables_created(&self) -> u64 {
        self.inner.tables_created.load(Ordering::Relaxed)
    }

    pub fn provision_waits(&self) -> u64 {
        self.inner.provision_waits.load(Ordering::Relaxed)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.inner.start_time.elapsed().as_secs_f64()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = Metrics::new();
        let other = metrics.clone();
        other.inc_batches();
        other.add_rows_inserted(3);
        metrics.add_bytes_sent(42);
        assert_eq!(metrics.batches(), 1);
        assert_eq!(metrics.rows_inserted(), 3);
        assert_eq!(other.bytes_sent(), 42);
    }
}
