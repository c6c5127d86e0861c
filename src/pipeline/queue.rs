//! Flush scheduler for the continuous insert path.
//!
//! Rows accumulate in the current [`Batch`] until it cannot take the next row,
//! becomes full, or the deferred flush timer fires. Flushed batches go to a
//! single dispatcher thread, so flushes of one queue are written strictly in
//! the order they were taken. The queue never retries; outcomes are delivered
//! to each row's callback and to the [`FlushListener`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{never, select, unbounded, Receiver, SendError, Sender};
use log::{debug, error};
use serde::Serialize;

use crate::error::{InsertError, Result};
use crate::metrics::Metrics;
use crate::pipeline::batch::{Batch, BatchLimits, InsertCallback};
use crate::pipeline::executor::{Delivery, FlushListener, InsertExecutor};
use crate::row::InsertRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub limits: BatchLimits,
    /// Attach a generated insert id to every encoded row.
    pub create_insert_id: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            limits: BatchLimits::default(),
            create_insert_id: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    Capacity,
    Full,
    Timer,
    Manual,
}

enum TimerCommand {
    Arm { id: u64, deadline: Instant },
    Cancel { id: u64 },
    Shutdown,
}

struct QueueState {
    batch: Batch,
    /// Id of the armed flush timer, if any. At most one per queue.
    pending: Option<u64>,
    next_timer_id: u64,
    dispatch: Option<Sender<Batch>>,
}

struct Shared {
    limits: BatchLimits,
    state: Mutex<QueueState>,
    timer: Sender<TimerCommand>,
    metrics: Metrics,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swaps in an empty batch and hands the old one to the dispatcher.
    ///
    /// Timer commands and dispatches are sent under the state lock so their
    /// channel order matches the order of flushes. A batch the dispatcher can
    /// no longer accept is returned so the caller can fail it after unlocking.
    fn flush_locked(&self, state: &mut QueueState, trigger: FlushTrigger) -> Option<Batch> {
        if let Some(id) = state.pending.take() {
            let _ = self.timer.send(TimerCommand::Cancel { id });
        }

        let batch = std::mem::replace(&mut state.batch, Batch::new(self.limits));
        if batch.is_empty() {
            return None;
        }

        debug!(
            "Flushing {} row(s), {} bytes, age {:?} ({:?})",
            batch.len(),
            batch.bytes(),
            batch.age(),
            trigger
        );
        self.metrics.inc_batches();

        match &state.dispatch {
            Some(tx) => tx.send(batch).err().map(|SendError(batch)| batch),
            None => Some(batch),
        }
    }

    fn arm_timer(&self, state: &mut QueueState) {
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        state.pending = Some(id);
        let deadline = Instant::now() + self.limits.max_delay;
        let _ = self.timer.send(TimerCommand::Arm { id, deadline });
    }

    fn fire_timer(&self, id: u64) {
        let rejected = {
            let mut state = self.lock();
            if state.pending != Some(id) {
                return;
            }
            self.flush_locked(&mut state, FlushTrigger::Timer)
        };
        if let Some(batch) = rejected {
            reject(batch, &self.metrics);
        }
    }
}

/// Fails every row of a batch that could not be dispatched.
fn reject(batch: Batch, metrics: &Metrics) {
    let (rows, callbacks) = batch.into_parts();
    error!("Dropping flush of {} row(s): insert queue is closed", rows.len());
    metrics.add_rows_failed(rows.len() as u64);
    let error = Arc::new(InsertError::QueueClosed);
    for (index, callback) in callbacks.into_iter().enumerate() {
        callback(Delivery::failed(index, Arc::clone(&error)));
    }
}

fn run_timer(shared: Arc<Shared>, commands: Receiver<TimerCommand>) {
    let mut armed: Option<(u64, Instant)> = None;
    loop {
        let deadline = match armed {
            Some((_, at)) => crossbeam_channel::at(at),
            None => never(),
        };
        select! {
            recv(commands) -> command => match command {
                Ok(TimerCommand::Arm { id, deadline }) => armed = Some((id, deadline)),
                Ok(TimerCommand::Cancel { id }) => {
                    if armed.is_some_and(|(armed_id, _)| armed_id == id) {
                        armed = None;
                    }
                }
                Ok(TimerCommand::Shutdown) | Err(_) => break,
            },
            recv(deadline) -> _ => {
                if let Some((id, _)) = armed.take() {
                    shared.fire_timer(id);
                }
            }
        }
    }
}

fn run_dispatcher(
    executor: InsertExecutor,
    batches: Receiver<Batch>,
    listener: Arc<dyn FlushListener>,
) {
    for batch in batches {
        executor.flush(batch, listener.as_ref());
    }
}

/// Batches rows for one table and flushes them by size, count or age.
pub struct InsertQueue {
    shared: Arc<Shared>,
    create_insert_id: bool,
    timer_handle: Option<JoinHandle<()>>,
    dispatch_handle: Option<JoinHandle<()>>,
}

impl InsertQueue {
    pub fn new(
        executor: InsertExecutor,
        options: QueueOptions,
        listener: Arc<dyn FlushListener>,
        metrics: Metrics,
    ) -> Self {
        let limits = options.limits;
        let (timer_tx, timer_rx) = unbounded();
        let (dispatch_tx, dispatch_rx) = unbounded();

        let shared = Arc::new(Shared {
            limits,
            state: Mutex::new(QueueState {
                batch: Batch::new(limits),
                pending: None,
                next_timer_id: 0,
                dispatch: Some(dispatch_tx),
            }),
            timer: timer_tx,
            metrics,
        });

        let timer_shared = Arc::clone(&shared);
        let timer_handle = thread::spawn(move || run_timer(timer_shared, timer_rx));
        let dispatch_handle =
            thread::spawn(move || run_dispatcher(executor, dispatch_rx, listener));

        Self {
            shared,
            create_insert_id: options.create_insert_id,
            timer_handle: Some(timer_handle),
            dispatch_handle: Some(dispatch_handle),
        }
    }

    pub fn limits(&self) -> BatchLimits {
        self.shared.limits
    }

    /// Rows waiting in the current batch.
    pub fn pending_rows(&self) -> usize {
        self.shared.lock().batch.len()
    }

    /// Encodes `row` and enqueues it. `callback` fires exactly once, after the
    /// batch holding the row has been written.
    pub fn add<T, F>(&self, row: &T, callback: F) -> Result<()>
    where
        T: Serialize + ?Sized,
        F: FnOnce(Delivery) + Send + 'static,
    {
        let row = InsertRow::encode(row, self.create_insert_id)?;
        self.add_row(row, Box::new(callback))
    }

    /// Enqueues an already encoded row.
    pub fn add_row(&self, row: InsertRow, callback: InsertCallback) -> Result<()> {
        let max_bytes = self.shared.limits.max_bytes;
        if row.bytes() > max_bytes {
            return Err(InsertError::RowTooLarge {
                bytes: row.bytes(),
                max: max_bytes,
            });
        }

        let mut rejected = Vec::new();
        {
            let mut state = self.shared.lock();
            if state.dispatch.is_none() {
                return Err(InsertError::QueueClosed);
            }

            if !state.batch.can_fit(&row) {
                rejected.extend(self.shared.flush_locked(&mut state, FlushTrigger::Capacity));
            }

            state.batch.add(row, callback);
            self.shared.metrics.inc_rows_enqueued();

            if state.batch.is_full() {
                rejected.extend(self.shared.flush_locked(&mut state, FlushTrigger::Full));
            } else if state.pending.is_none() {
                self.shared.arm_timer(&mut state);
            }
        }

        for batch in rejected {
            reject(batch, &self.shared.metrics);
        }
        Ok(())
    }

    /// Flushes whatever is pending. A no-op when the batch is empty.
    pub fn flush(&self) {
        let rejected = {
            let mut state = self.shared.lock();
            self.shared.flush_locked(&mut state, FlushTrigger::Manual)
        };
        if let Some(batch) = rejected {
            reject(batch, &self.shared.metrics);
        }
    }

    /// Flushes pending rows and waits until every dispatched batch is written.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.timer_handle.is_none() && self.dispatch_handle.is_none() {
            return;
        }

        self.flush();

        let _ = self.shared.timer.send(TimerCommand::Shutdown);
        if let Some(handle) = self.timer_handle.take() {
            if handle.join().is_err() {
                error!("Flush timer thread panicked");
            }
        }

        // Dropping the sender lets the dispatcher drain and exit.
        self.shared.lock().dispatch = None;
        if let Some(handle) = self.dispatch_handle.take() {
            if handle.join().is_err() {
                error!("Insert dispatcher thread panicked");
            }
        }
    }
}

impl Drop for InsertQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InsertAllRequest, InsertAllResponse, StreamingBackend};
    use crate::error::ApiError;
    use crate::schema::TableSchema;
    use crate::pipeline::executor::FlushEvent;
    use crate::table::TableRef;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingBackend {
        calls: Mutex<Vec<usize>>,
    }

    impl StreamingBackend for CountingBackend {
        fn insert_all(
            &self,
            _table: &TableRef,
            request: &InsertAllRequest<'_>,
        ) -> std::result::Result<InsertAllResponse, ApiError> {
            self.calls.lock().unwrap().push(request.rows.len());
            Ok(InsertAllResponse::ok())
        }

        fn create_table(
            &self,
            _table: &TableRef,
            _schema: &TableSchema,
        ) -> std::result::Result<(), ApiError> {
            Ok(())
        }
    }

    fn queue(
        limits: BatchLimits,
    ) -> (InsertQueue, Arc<CountingBackend>, Receiver<FlushEvent>) {
        let backend = Arc::new(CountingBackend::default());
        let metrics = Metrics::new();
        let executor = InsertExecutor::new(
            backend.clone(),
            TableRef::new("d", "t"),
            Default::default(),
            metrics.clone(),
        );
        let (tx, rx) = unbounded();
        let options = QueueOptions {
            limits,
            create_insert_id: true,
        };
        (InsertQueue::new(executor, options, Arc::new(tx), metrics), backend, rx)
    }

    #[test]
    fn empty_flush_is_noop() {
        let (q, backend, events) = queue(BatchLimits::default());
        q.flush();
        q.close();
        assert!(backend.calls.lock().unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn full_batch_flushes_immediately() {
        let (q, backend, events) = queue(BatchLimits::new(1 << 20, 2, Duration::from_secs(60)));
        q.add(&json!({"n": 1}), |_| {}).unwrap();
        q.add(&json!({"n": 2}), |_| {}).unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.rows(), 2);
        assert_eq!(q.pending_rows(), 0);
        q.close();
        assert_eq!(*backend.calls.lock().unwrap(), vec![2]);
    }

    #[test]
    fn timer_flushes_partial_batch() {
        let (q, backend, events) = queue(BatchLimits::new(1 << 20, 100, Duration::from_millis(20)));
        q.add(&json!({"n": 1}), |_| {}).unwrap();

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.rows(), 1);
        assert!(!event.is_error());
        q.close();
        assert_eq!(*backend.calls.lock().unwrap(), vec![1]);
    }

    #[test]
    fn oversized_row_is_rejected() {
        let (q, _backend, _events) = queue(BatchLimits::new(16, 100, Duration::from_secs(60)));
        let err = q
            .add(&json!({"payload": "far too long for sixteen bytes"}), |_| {})
            .unwrap_err();
        assert!(matches!(err, InsertError::RowTooLarge { max: 16, .. }));
        assert_eq!(q.pending_rows(), 0);
    }
}
