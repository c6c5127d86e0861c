mod common;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use common::{recording_sleeper, table_ref, temp_dir};
use stream_insert::metrics::Metrics;
use stream_insert::pipeline::executor::NoopListener;
use stream_insert::{
    BatchLimits, InsertError, InsertRequestOptions, InsertRowsOptions, LocalStore, QueueOptions,
    StreamingBackend, Table, TableSchema,
};

#[derive(Serialize)]
struct Click {
    user: String,
    page: String,
    millis: i64,
}

fn schema() -> TableSchema {
    "user:string,page:string,millis:integer".parse().unwrap()
}

fn table_in(store: &Arc<LocalStore>) -> Table {
    let (sleeper, _waits) = recording_sleeper();
    Table::new(table_ref(), store.clone(), Metrics::new()).with_sleeper(sleeper)
}

fn click(n: i64) -> Click {
    Click {
        user: format!("u{n}"),
        page: "/home".to_string(),
        millis: n,
    }
}

#[test]
fn one_shot_insert_provisions_and_writes() {
    let dir = temp_dir();
    let store = Arc::new(LocalStore::new(dir.path()));
    let table = table_in(&store);

    let options = InsertRowsOptions {
        schema: Some(schema()),
        ..InsertRowsOptions::default()
    };
    table.insert(&[click(1), click(2)], &options).unwrap();

    assert!(store.exists(&table_ref()));
    let rows = store.read_rows(&table_ref()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["user"], "u1");
    assert_eq!(rows[1]["millis"], 2);
    assert_eq!(table.metrics().tables_created(), 1);
}

#[test]
fn queue_streams_rows_in_order() {
    let dir = temp_dir();
    let store = Arc::new(LocalStore::new(dir.path()));
    store
        .create_table(&table_ref(), &schema())
        .unwrap();
    let table = table_in(&store);

    let queue = table.insert_queue(
        QueueOptions {
            limits: BatchLimits::new(1 << 20, 4, Duration::from_millis(5)),
            create_insert_id: true,
        },
        InsertRequestOptions::default(),
        Arc::new(NoopListener),
    );
    for n in 0..10 {
        queue.add(&click(n), |_| {}).unwrap();
    }
    queue.close();

    let millis: Vec<i64> = store
        .read_rows(&table_ref())
        .unwrap()
        .iter()
        .map(|row| row["millis"].as_i64().unwrap())
        .collect();
    assert_eq!(millis, (0..10).collect::<Vec<_>>());
    assert_eq!(table.metrics().rows_inserted(), 10);
}

#[test]
fn invalid_row_blocks_batch_unless_skipped() {
    let dir = temp_dir();
    let store = Arc::new(LocalStore::new(dir.path()));
    store
        .create_table(&table_ref(), &schema())
        .unwrap();
    let table = table_in(&store);

    let rows = [
        json!({ "user": "u1", "millis": 1 }),
        json!({ "user": "u2", "millis": "soon" }),
    ];

    let strict = InsertRowsOptions {
        partial_retries: 1,
        ..InsertRowsOptions::default()
    };
    let err = table.insert(&rows, &strict).unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    let reasons: Vec<&str> = partial
        .errors
        .iter()
        .map(|f| f.errors[0].reason.as_str())
        .collect();
    assert_eq!(reasons, vec!["stopped", "invalid"]);
    assert!(store.read_rows(&table_ref()).unwrap().is_empty());

    let lenient = InsertRowsOptions {
        partial_retries: 1,
        request: InsertRequestOptions {
            skip_invalid_rows: true,
            ..InsertRequestOptions::default()
        },
        ..InsertRowsOptions::default()
    };
    let err = table.insert(&rows, &lenient).unwrap_err();
    assert!(matches!(err, InsertError::PartialFailure(_)));
    assert_eq!(err.as_partial_failure().unwrap().errors.len(), 1);

    let written = store.read_rows(&table_ref()).unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0]["user"], "u1");
}
