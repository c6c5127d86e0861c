//! Run directory lifecycle and the artifacts written into it.
//!
//! A run directory holds `run.log`, `config_snapshot.yaml`, `report.yaml`
//! and `rejected.ndjson`, the rows the destination refused for good.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{PartialFailureError, PartialInsertFailure};

const RUN_PREFIX: &str = "run_";

pub struct RunContext {
    /// e.g. `runs/run_20250118_143022/`
    pub run_dir: PathBuf,
    pub run_id: String,
    pub start_time: DateTime<Utc>,
}

impl RunContext {
    pub fn new(runs_dir: &Path) -> Result<Self> {
        Self::new_with_run_id(runs_dir, None)
    }

    /// Creates `{runs_dir}/run_{YYYYMMDD_HHMMSS}/`, or `{runs_dir}/run_{id}/`
    /// when an id is forced. Never reuses an existing directory.
    pub fn new_with_run_id(runs_dir: &Path, forced: Option<String>) -> Result<Self> {
        let start_time = Utc::now();
        let run_id = match forced.as_deref() {
            Some(raw) => normalize_run_id(raw)?,
            None => format!("{RUN_PREFIX}{}", start_time.format("%Y%m%d_%H%M%S")),
        };

        let run_dir = runs_dir.join(&run_id);
        if run_dir.exists() {
            return Err(anyhow!("Run directory already exists: {}", run_dir.display()));
        }
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self {
            run_dir,
            run_id,
            start_time,
        })
    }

    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join("report.yaml")
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join("run.log")
    }

    pub fn config_snapshot_path(&self) -> PathBuf {
        self.run_dir.join("config_snapshot.yaml")
    }

    pub fn rejected_path(&self) -> PathBuf {
        self.run_dir.join("rejected.ndjson")
    }
}

/// Accepts `nightly-1` or `run_nightly-1`; only ASCII letters, digits, `_`
/// and `-` survive, so the id can never escape `runs_dir`.
fn normalize_run_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    let id = id.strip_prefix(RUN_PREFIX).unwrap_or(id);
    if id.is_empty() {
        return Err(anyhow!("run_id cannot be empty"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(anyhow!("run_id may not contain '{bad}'"));
    }
    Ok(format!("{RUN_PREFIX}{id}"))
}

/// Keeps the `keep_count` most recent run directories and removes the rest.
pub fn cleanup_old_runs(runs_dir: &Path, keep_count: usize) -> Result<()> {
    if !runs_dir.exists() {
        return Ok(());
    }

    let mut run_dirs: Vec<PathBuf> = fs::read_dir(runs_dir)
        .with_context(|| format!("Failed to read runs directory: {}", runs_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(RUN_PREFIX))
        })
        .collect();

    // Generated ids sort chronologically.
    run_dirs.sort();

    let excess = run_dirs.len().saturating_sub(keep_count);
    for dir in run_dirs.into_iter().take(excess) {
        match fs::remove_dir_all(&dir) {
            Ok(()) => log::debug!("Removed old run {}", dir.display()),
            Err(e) => log::warn!("Failed to remove old run directory {}: {}", dir.display(), e),
        }
    }

    Ok(())
}

/// Input position a row was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowOrigin {
    pub file: PathBuf,
    pub line: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectedRecord<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a RowOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    insert_id: Option<&'a str>,
    json: &'a Map<String, Value>,
    errors: Vec<RejectedReason<'a>>,
}

#[derive(Serialize)]
struct RejectedReason<'a> {
    reason: &'a str,
    message: &'a str,
}

/// Append-only NDJSON record of rows that were still rejected after every
/// retry. Shared across threads.
pub struct RejectLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    rows: AtomicU64,
}

impl RejectLog {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create reject log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            rows: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Appends one rejected row. Failures without a row reference are skipped.
    pub fn record(&self, failure: &PartialInsertFailure, origin: Option<&RowOrigin>) -> Result<()> {
        let Some(row) = &failure.row else {
            return Ok(());
        };
        let record = RejectedRecord {
            source: origin,
            insert_id: row.insert_id(),
            json: row.json(),
            errors: failure
                .errors
                .iter()
                .map(|e| RejectedReason {
                    reason: &e.reason,
                    message: &e.message,
                })
                .collect(),
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_all(&self, err: &PartialFailureError) -> Result<()> {
        err.errors
            .iter()
            .try_for_each(|failure| self.record(failure, None))
    }

    pub fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .with_context(|| format!("Failed to flush reject log {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorDetail;
    use crate::row::InsertRow;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn creates_timestamped_run_dir() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let ctx = RunContext::new(&runs).unwrap();

        assert!(ctx.run_dir.is_dir());
        assert!(ctx.run_id.starts_with(RUN_PREFIX));
        assert!(ctx.log_path().ends_with("run.log"));
        assert!(ctx.rejected_path().ends_with("rejected.ndjson"));
    }

    #[test]
    fn forced_run_id_is_normalized_and_never_reused() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");

        let ctx = RunContext::new_with_run_id(&runs, Some("nightly-1".to_string())).unwrap();
        assert_eq!(ctx.run_id, "run_nightly-1");
        assert!(RunContext::new_with_run_id(&runs, Some("run_nightly-1".to_string())).is_err());
        assert!(RunContext::new_with_run_id(&runs, Some("../escape".to_string())).is_err());
        assert!(RunContext::new_with_run_id(&runs, Some("  ".to_string())).is_err());
    }

    #[test]
    fn cleanup_keeps_most_recent_runs() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        for day in 1..=5 {
            fs::create_dir_all(runs.join(format!("run_2025010{day}_120000"))).unwrap();
        }
        fs::create_dir_all(runs.join("scratch")).unwrap();

        cleanup_old_runs(&runs, 2).unwrap();

        let mut remaining: Vec<_> = fs::read_dir(&runs)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["run_20250104_120000", "run_20250105_120000", "scratch"]
        );
    }

    #[test]
    fn reject_log_writes_rows_with_reasons() {
        let dir = TempDir::new().unwrap();
        let log = RejectLog::create(&dir.path().join("rejected.ndjson")).unwrap();

        let row = InsertRow::new(
            json!({"n": 1}).as_object().cloned().unwrap(),
            Some("id-1".to_string()),
        )
        .unwrap();
        let reason = ErrorDetail {
            message: "bad value".to_string(),
            reason: "invalid".to_string(),
        };
        let origin = RowOrigin {
            file: PathBuf::from("data/rows.ndjson"),
            line: 42,
        };
        log.record(
            &PartialInsertFailure {
                index: 3,
                row: Some(row.clone()),
                errors: vec![reason.clone()],
            },
            Some(&origin),
        )
        .unwrap();
        log.record(
            &PartialInsertFailure {
                index: 9,
                row: None,
                errors: vec![reason.clone()],
            },
            None,
        )
        .unwrap();
        log.record(
            &PartialInsertFailure {
                index: 0,
                row: Some(row),
                errors: vec![reason],
            },
            None,
        )
        .unwrap();
        log.flush().unwrap();

        assert_eq!(log.rows(), 2);
        let written = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0]["source"]["file"], "data/rows.ndjson");
        assert_eq!(lines[0]["source"]["line"], 42);
        assert!(lines[0].get("index").is_none());
        assert_eq!(lines[0]["insertId"], "id-1");
        assert_eq!(lines[0]["json"]["n"], 1);
        assert_eq!(lines[0]["errors"][0]["reason"], "invalid");
        assert!(lines[1].get("source").is_none());
    }
}
