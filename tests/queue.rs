mod common;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;

use common::{rejected, table_on, ScriptedBackend};
use stream_insert::{
    ApiError, BatchLimits, Delivery, FlushEvent, InsertError, InsertQueue, InsertRow,
    InsertRequestOptions, QueueOptions,
};

fn start(
    backend: &Arc<ScriptedBackend>,
    limits: BatchLimits,
) -> (InsertQueue, Receiver<FlushEvent>) {
    let table = table_on(backend);
    let (tx, rx) = unbounded();
    let options = QueueOptions {
        limits,
        create_insert_id: true,
    };
    (
        table.insert_queue(options, InsertRequestOptions::default(), Arc::new(tx)),
        rx,
    )
}

fn no_timer(max_rows: usize) -> BatchLimits {
    BatchLimits::new(1 << 20, max_rows, Duration::from_secs(3600))
}

#[test]
fn max_rows_two_splits_three_rows_into_two_flushes() {
    let backend = ScriptedBackend::new();
    let (queue, events) = start(&backend, no_timer(2));

    for n in 0..3 {
        queue.add(&json!({ "n": n }), |_| {}).unwrap();
    }

    let first = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first.rows(), 2);
    assert_eq!(queue.pending_rows(), 1);

    queue.close();
    assert_eq!(backend.request_sizes(), vec![2, 1]);
    let rest: Vec<_> = events.try_iter().collect();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].rows(), 1);
}

#[test]
fn byte_capacity_flushes_before_overflow() {
    let backend = ScriptedBackend::new();
    let row_bytes = InsertRow::encode(&json!({ "n": 0 }), false).unwrap().bytes();
    let limits = BatchLimits::new(row_bytes * 2 + 1, 100, Duration::from_secs(3600));
    let table = table_on(&backend);
    let queue = table.insert_queue(
        QueueOptions {
            limits,
            create_insert_id: false,
        },
        InsertRequestOptions::default(),
        Arc::new(stream_insert::pipeline::executor::NoopListener),
    );

    for n in 0..5 {
        queue.add(&json!({ "n": n }), |_| {}).unwrap();
    }
    queue.close();

    assert_eq!(backend.request_sizes(), vec![2, 2, 1]);
    for request in backend.requests() {
        let bytes: usize = request.iter().map(InsertRow::bytes).sum();
        assert!(bytes <= limits.max_bytes);
    }
}

#[test]
fn every_callback_fires_exactly_once() {
    let backend = ScriptedBackend::new();
    let (queue, _events) = start(&backend, no_timer(3));
    let (tx, rx) = unbounded::<usize>();

    for n in 0..10 {
        let tx = tx.clone();
        queue
            .add(&json!({ "n": n }), move |_| tx.send(n).unwrap())
            .unwrap();
    }
    drop(tx);
    queue.close();

    let mut fired: Vec<usize> = rx.iter().collect();
    fired.sort();
    assert_eq!(fired, (0..10).collect::<Vec<_>>());
    assert_eq!(backend.request_sizes(), vec![3, 3, 3, 1]);
}

#[test]
fn partial_failure_is_fanned_out_to_the_whole_batch() {
    let backend = ScriptedBackend::new();
    backend.reply(rejected(&[1]));
    let (queue, events) = start(&backend, no_timer(3));
    let (tx, rx) = unbounded::<Delivery>();

    for n in 0..3 {
        let tx = tx.clone();
        queue
            .add(&json!({ "n": n }), move |delivery| tx.send(delivery).unwrap())
            .unwrap();
    }
    drop(tx);
    queue.close();

    let mut deliveries: Vec<Delivery> = rx.iter().collect();
    deliveries.sort_by_key(Delivery::index);
    assert_eq!(deliveries.len(), 3);

    let submitted = &backend.requests()[0];
    for delivery in &deliveries {
        let err = delivery.result().as_ref().unwrap_err();
        let partial = err.as_partial_failure().unwrap();
        assert_eq!(partial.errors.len(), 1);
        assert_eq!(partial.errors[0].index, 1);
        assert_eq!(partial.failed_rows(), vec![submitted[1].clone()]);
    }
    assert!(deliveries[0].row_errors().is_none());
    assert_eq!(deliveries[1].row_errors().unwrap()[0].message, "bad value");
    assert!(deliveries[2].row_errors().is_none());

    // The queue itself never retries.
    assert_eq!(backend.request_sizes(), vec![3]);
    let event = events.try_recv().unwrap();
    assert!(event.is_error());
    assert_eq!(event.rows(), 3);
}

#[test]
fn transport_error_reaches_every_row() {
    let backend = ScriptedBackend::new();
    backend.reply(Err(ApiError::new(503, "backend unavailable")));
    let (queue, events) = start(&backend, no_timer(2));
    let (tx, rx) = unbounded::<Delivery>();

    for n in 0..2 {
        let tx = tx.clone();
        queue
            .add(&json!({ "n": n }), move |delivery| tx.send(delivery).unwrap())
            .unwrap();
    }
    drop(tx);
    queue.close();

    let deliveries: Vec<Delivery> = rx.iter().collect();
    assert_eq!(deliveries.len(), 2);
    for delivery in deliveries {
        assert!(matches!(
            delivery.result().as_ref().unwrap_err().as_ref(),
            InsertError::Transport(ApiError { code: 503, .. })
        ));
        assert!(delivery.row_errors().is_none());
    }
    assert!(matches!(events.try_recv().unwrap(), FlushEvent::Error { rows: 2, .. }));
}

#[test]
fn consecutive_flushes_are_written_in_order() {
    let backend = ScriptedBackend::new();
    let (queue, events) = start(&backend, no_timer(1));

    for n in 0..50 {
        queue.add(&json!({ "n": n }), |_| {}).unwrap();
    }
    queue.close();

    let written: Vec<i64> = backend
        .requests()
        .iter()
        .flatten()
        .map(|row| row.json()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(written, (0..50).collect::<Vec<_>>());
    assert_eq!(events.try_iter().count(), 50);
}

#[test]
fn rows_carry_generated_insert_ids() {
    let backend = ScriptedBackend::new();
    let (queue, _events) = start(&backend, no_timer(10));

    queue.add(&json!({ "n": 1 }), |_| {}).unwrap();
    queue.add(&json!({ "n": 2 }), |_| {}).unwrap();
    queue.close();

    let rows = &backend.requests()[0];
    let first = rows[0].insert_id().unwrap();
    let second = rows[1].insert_id().unwrap();
    assert_ne!(first, second);
}

#[test]
fn timer_flush_delivers_without_close() {
    let backend = ScriptedBackend::new();
    let (queue, events) = start(
        &backend,
        BatchLimits::new(1 << 20, 100, Duration::from_millis(10)),
    );

    queue.add(&json!({ "n": 1 }), |_| {}).unwrap();
    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.rows(), 1);
    assert_eq!(queue.pending_rows(), 0);

    queue.add(&json!({ "n": 2 }), |_| {}).unwrap();
    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(event.rows(), 1);

    queue.close();
    assert_eq!(backend.request_sizes(), vec![1, 1]);
}

#[test]
fn non_object_rows_are_refused() {
    let backend = ScriptedBackend::new();
    let (queue, _events) = start(&backend, no_timer(10));

    let err = queue.add(&json!([1, 2, 3]), |_| {}).unwrap_err();
    assert!(matches!(err, InsertError::NotAnObject));
    queue.close();
    assert!(backend.requests().is_empty());
}
