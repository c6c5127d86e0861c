use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde_json::{Map, Value};
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use stream_insert::cli::{Args, Mode};
use stream_insert::config::Settings;
use stream_insert::metrics::Metrics;
use stream_insert::pipeline::reader::open_rows;
use stream_insert::report::{RunReport, RunStatus};
use stream_insert::runs::{cleanup_old_runs, RejectLog, RowOrigin, RunContext};
use stream_insert::{
    Delivery, FlushEvent, InsertError, InsertQueue, InsertRow, LocalStore, StreamingBackend, Table,
};

/// A writer that tees log output to both a file and stderr.
struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Routes `log` records to stderr and `run.log`. `RUST_LOG` wins over the
/// configured level.
fn init_logging(level: &str, log_path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })))
        .try_init()
        .context("Failed to initialize logger")
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load settings from YAML, with CLI overrides
    let overrides = args.overrides();
    let applied = overrides.applied();
    let mut settings = Settings::load_from_yaml(args.config.as_deref())?.merge_with_cli(overrides);

    // Resolve paths relative to current working directory (project root)
    let root = env::current_dir()?;
    settings.resolve_paths(&root);

    let run_context = RunContext::new_with_run_id(&settings.runs.runs_dir, args.run_id.clone())?;
    init_logging(&settings.logging.log_level, &run_context.log_path())?;

    info!("Run ID: {}", run_context.run_id);
    info!("Run directory: {}", run_context.run_dir.display());
    match &settings.source {
        Some(path) => info!("Config loaded from {}", path.display()),
        None => info!("Config file not found, using defaults"),
    }
    if let Some(warning) = settings.version_warning() {
        warn!("{}", warning);
    }
    for name in applied {
        info!("CLI override: {}", name);
    }

    settings.save_snapshot(&run_context.config_snapshot_path())?;
    info!(
        "Config snapshot saved to {}",
        run_context.config_snapshot_path().display()
    );

    let table_ref = settings.table_ref()?;
    let limits = settings.batch_limits();
    info!("Configuration ready");
    info!("  Input: {}", settings.input_path()?.display());
    info!("  Store: {}", settings.storage.store_dir.display());
    info!("  Table: {}", table_ref);
    info!("  Mode: {:?}{}", args.mode, if args.raw { " (raw rows)" } else { "" });
    info!(
        "  Batch limits: {} rows, {} bytes, {:?}",
        limits.max_rows, limits.max_bytes, limits.max_delay
    );
    info!("  Partial retries: {}", settings.insert.partial_retries);

    let metrics = Metrics::new();

    // Start a lightweight terminal progress bar that updates from Metrics
    let progress_running = Arc::new(AtomicBool::new(true));
    let progress_flag = Arc::clone(&progress_running);
    let progress_metrics = metrics.clone();
    let progress_interval = Duration::from_millis(settings.logging.progress_interval_millis);
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("[{spinner}] {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(progress_interval);
    let progress_handle = thread::spawn(move || {
        while progress_flag.load(Ordering::Relaxed) {
            let elapsed = progress_metrics.elapsed_secs();
            let inserted = progress_metrics.rows_inserted();
            let rps = if elapsed > 0.0 {
                inserted as f64 / elapsed
            } else {
                0.0
            };
            let mb_read = progress_metrics.bytes_read() as f64 / (1024.0 * 1024.0);
            pb.set_message(format!(
                "enqueued: {} | inserted: {} ({:.0}/s) | failed: {} | batches: {} | retries: {} | read: {:.2} MB",
                progress_metrics.rows_enqueued(),
                inserted,
                rps,
                progress_metrics.rows_failed(),
                progress_metrics.batches(),
                progress_metrics.partial_retries(),
                mb_read
            ));
            thread::sleep(progress_interval);
        }
        pb.finish_and_clear();
    });

    let store = Arc::new(LocalStore::new(settings.storage.store_dir.clone()));
    let table = Table::new(table_ref.clone(), store.clone(), metrics.clone())
        .with_provision_policy(settings.provision_policy());

    let rejects = Arc::new(RejectLog::create(&run_context.rejected_path())?);

    let run_result = resolve_inputs(settings.input_path()?).and_then(|files| match args.mode {
        Mode::Stream => run_stream(&files, &settings, &table, store.as_ref(), &rejects, args.raw),
        Mode::Insert => run_insert(&files, &settings, &table, &rejects, args.raw),
    });

    match rejects.flush() {
        Ok(()) if rejects.rows() > 0 => warn!(
            "{} rejected row(s) written to {}",
            rejects.rows(),
            rejects.path().display()
        ),
        Ok(()) => {}
        Err(e) => error!("{:#}", e),
    }

    // Generate report (even on error)
    let status = match &run_result {
        Ok(()) => RunStatus::Success,
        Err(e) => RunStatus::Error {
            message: format!("{:#}", e),
        },
    };
    let mode = format!("{:?}", args.mode).to_lowercase();
    let report = RunReport::generate(
        &run_context,
        &metrics,
        &settings,
        &mode,
        &table_ref.to_string(),
        status,
    );

    if let Err(e) = report.save_yaml(&run_context.report_path()) {
        error!("Failed to save report: {}", e);
    } else {
        info!("Report saved to {}", run_context.report_path().display());
    }

    progress_running.store(false, Ordering::Relaxed);
    let _ = progress_handle.join();

    print_summary(&metrics);

    if let Err(e) = cleanup_old_runs(&settings.runs.runs_dir, settings.runs.keep_runs) {
        warn!("Failed to cleanup old runs: {}", e);
    }

    run_result
}

/// Expands the input into files: a directory yields its NDJSON files, a
/// pattern is globbed, anything else is taken as a single file.
fn resolve_inputs(input: &Path) -> Result<Vec<PathBuf>> {
    let patterns: Vec<String> = if input.is_dir() {
        ["*.ndjson", "*.ndjson.gz", "*.jsonl", "*.jsonl.gz"]
            .iter()
            .map(|ext| input.join(ext).to_string_lossy().to_string())
            .collect()
    } else {
        let text = input.to_string_lossy();
        if !text.contains(['*', '?', '[']) {
            return Ok(vec![input.to_path_buf()]);
        }
        vec![text.to_string()]
    };

    let mut files = Vec::new();
    for pattern in &patterns {
        for entry in glob(pattern)? {
            match entry {
                Ok(path) => files.push(path),
                Err(e) => warn!("Failed to read glob entry: {}", e),
            }
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(anyhow!("No NDJSON files found for {}", input.display()));
    }
    info!("Found {} input file(s)", files.len());
    Ok(files)
}

/// Converts a parsed line into a row. Raw lines carry their own
/// `{"insertId", "json"}` envelope.
fn to_row(line: Map<String, Value>, raw: bool, create_insert_id: bool) -> stream_insert::Result<InsertRow> {
    if raw {
        Ok(serde_json::from_value(Value::Object(line))?)
    } else {
        InsertRow::encode(&line, create_insert_id)
    }
}

/// Streams every file into one shared queue, reading files in parallel.
fn run_stream(
    files: &[PathBuf],
    settings: &Settings,
    table: &Table,
    store: &LocalStore,
    rejects: &Arc<RejectLog>,
    raw: bool,
) -> Result<()> {
    let options = settings.insert_options()?;

    // The queue never provisions, so create the table up front when asked to.
    if let Some(schema) = &options.schema {
        if !store.exists(table.reference()) {
            match store.create_table(table.reference(), schema) {
                Ok(()) => {
                    info!("Created table {}", table.reference());
                    table.metrics().inc_tables_created();
                }
                Err(e) if e.code == 409 => {}
                Err(e) => return Err(InsertError::from_api(e).into()),
            }
        }
    }

    let (tx, rx) = unbounded::<FlushEvent>();
    let queue = table.insert_queue(settings.queue_options(), options.request.clone(), Arc::new(tx));

    let failure_count = AtomicUsize::new(0);
    files.par_iter().for_each(|path| {
        info!("Streaming: {}", path.display());
        if let Err(e) = stream_file(path, &queue, settings, table.metrics(), rejects, raw) {
            error!("Failed to stream {}: {}", path.display(), e);
            failure_count.fetch_add(1, Ordering::Relaxed);
        }
    });

    queue.close();

    let events: Vec<FlushEvent> = rx.try_iter().collect();
    let failed_flushes = events.iter().filter(|e| e.is_error()).count();
    info!(
        "Queue drained: {} flush(es), {} failed",
        events.len(),
        failed_flushes
    );

    let failures = failure_count.load(Ordering::Relaxed);
    if failures > 0 {
        return Err(anyhow!(
            "{} of {} file(s) failed to stream",
            failures,
            files.len()
        ));
    }
    if failed_flushes > 0 {
        return Err(anyhow!(
            "{} of {} flush(es) failed; see run.log",
            failed_flushes,
            events.len()
        ));
    }
    Ok(())
}

fn stream_file(
    path: &Path,
    queue: &InsertQueue,
    settings: &Settings,
    metrics: &Metrics,
    rejects: &Arc<RejectLog>,
    raw: bool,
) -> stream_insert::Result<()> {
    let mut rows = open_rows(path, settings.storage.buffer_size, metrics)?;
    while let Some(line) = rows.next() {
        let row = to_row(line?, raw, settings.insert.create_insert_id)?;
        let origin = RowOrigin {
            file: path.to_path_buf(),
            line: rows.line(),
        };
        let rejects = Arc::clone(rejects);
        queue.add_row(
            row,
            Box::new(move |delivery: Delivery| {
                let Some(failure) = delivery.failure() else {
                    return;
                };
                for detail in &failure.errors {
                    debug!(
                        "{}:{} rejected ({}): {}",
                        origin.file.display(),
                        origin.line,
                        detail.reason,
                        detail.message
                    );
                }
                if let Err(e) = rejects.record(failure, Some(&origin)) {
                    error!("Failed to record rejected row: {:#}", e);
                }
            }),
        )?;
    }
    Ok(())
}

/// Loads every row, then writes them with one retrying insert.
fn run_insert(
    files: &[PathBuf],
    settings: &Settings,
    table: &Table,
    rejects: &RejectLog,
    raw: bool,
) -> Result<()> {
    let options = settings.insert_options()?;

    let per_file = files
        .par_iter()
        .map(|path| -> Result<Vec<InsertRow>> {
            open_rows(path, settings.storage.buffer_size, table.metrics())?
                .map(|line| to_row(line?, raw, options.create_insert_id))
                .collect::<stream_insert::Result<Vec<_>>>()
                .with_context(|| format!("Failed to read {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let rows: Vec<InsertRow> = per_file.into_iter().flatten().collect();
    info!("Loaded {} row(s)", rows.len());

    match table.insert_raw(rows, &options) {
        Ok(_) => Ok(()),
        Err(InsertError::PartialFailure(partial)) => {
            for failure in &partial.errors {
                for detail in &failure.errors {
                    warn!(
                        "Row {} rejected ({}): {}",
                        failure.index, detail.reason, detail.message
                    );
                }
            }
            rejects.record_all(&partial)?;
            Err(anyhow!(
                "{} row(s) still rejected after {} retries",
                partial.errors.len(),
                options.partial_retries
            ))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_summary(metrics: &Metrics) {
    let elapsed = metrics.elapsed_secs();
    let inserted = metrics.rows_inserted();
    let rows_per_sec = if elapsed > 0.0 {
        inserted as f64 / elapsed
    } else {
        0.0
    };
    let mb_read = metrics.bytes_read() as f64 / (1024.0 * 1024.0);
    let mb_sent = metrics.bytes_sent() as f64 / (1024.0 * 1024.0);

    info!("");
    info!("=== Insert Summary ===");
    info!("Rows enqueued:   {}", metrics.rows_enqueued());
    info!("Rows inserted:   {}", inserted);
    info!("Rows failed:     {}", metrics.rows_failed());
    info!("Batches flushed: {}", metrics.batches());
    info!("Write calls:     {}", metrics.write_calls());
    info!("Partial retries: {}", metrics.partial_retries());
    info!("Tables created:  {}", metrics.tables_created());
    info!("Time elapsed:    {:.2}s", elapsed);
    info!("Throughput:      {:.0} rows/sec", rows_per_sec);
    info!("Bytes read:      {:.2} MB", mb_read);
    info!("Bytes sent:      {:.2} MB", mb_sent);
}
