//! Run report generation and YAML serialization.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use sysinfo::System;

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::runs::RunContext;

/// Outcome of a run, flattened into the report as `status`.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "status")]
pub enum RunStatus {
    Success,
    Error { message: String },
}

/// Everything `report.yaml` records about one run.
#[derive(Serialize, Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(flatten)]
    pub status: RunStatus,
    pub mode: String,
    pub table: String,

    pub limits: EffectiveLimits,
    pub environment: EnvironmentInfo,
    pub performance: InsertStats,
}

/// Batching and retry limits actually in force, after clamping.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct EffectiveLimits {
    pub max_rows: usize,
    pub max_bytes: usize,
    pub max_delay_millis: u64,
    pub partial_retries: u32,
    pub provision_attempts: u32,
}

impl EffectiveLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        let limits = settings.batch_limits();
        Self {
            max_rows: limits.max_rows,
            max_bytes: limits.max_bytes,
            max_delay_millis: u64::try_from(limits.max_delay.as_millis()).unwrap_or(u64::MAX),
            partial_retries: settings.insert.partial_retries,
            provision_attempts: settings.provision.max_attempts,
        }
    }
}

/// Host the run executed on.
#[derive(Serialize, Clone, Debug)]
pub struct EnvironmentInfo {
    pub os: String,
    pub os_version: String,
    pub cpu_cores: usize,
    pub total_memory_gb: f64,
}

/// Counters copied out of [`Metrics`] when the run ends.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct InsertStats {
    pub rows_enqueued: u64,
    pub rows_inserted: u64,
    pub rows_failed: u64,
    pub rows_per_sec: f64,
    pub batches_flushed: u64,
    pub write_calls: u64,
    pub avg_rows_per_write: f64,
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub partial_retries: u64,
    pub tables_created: u64,
    pub provision_waits: u64,
}

impl EnvironmentInfo {
    /// Reads OS name and version, CPU count and total memory from the host.
    pub fn gather() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        Self {
            os: System::name().unwrap_or_else(|| "Unknown".to_string()),
            os_version: System::os_version().unwrap_or_else(|| "Unknown".to_string()),
            cpu_cores: sys.cpus().len(),
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
        }
    }
}

impl InsertStats {
    /// Derives rates from the raw counters; zero when nothing was timed or written.
    pub fn from_metrics(metrics: &Metrics) -> Self {
        let elapsed = metrics.elapsed_secs();
        let rows_inserted = metrics.rows_inserted();
        let write_calls = metrics.write_calls();

        Self {
            rows_enqueued: metrics.rows_enqueued(),
            rows_inserted,
            rows_failed: metrics.rows_failed(),
            rows_per_sec: if elapsed > 0.0 {
                rows_inserted as f64 / elapsed
            } else {
                0.0
            },
            batches_flushed: metrics.batches(),
            write_calls,
            avg_rows_per_write: if write_calls > 0 {
                rows_inserted as f64 / write_calls as f64
            } else {
                0.0
            },
            bytes_read: metrics.bytes_read(),
            bytes_sent: metrics.bytes_sent(),
            partial_retries: metrics.partial_retries(),
            tables_created: metrics.tables_created(),
            provision_waits: metrics.provision_waits(),
        }
    }
}

impl RunReport {
    /// Builds the report at the end of a run, whether it succeeded or not.
    pub fn generate(
        run_context: &RunContext,
        metrics: &Metrics,
        settings: &Settings,
        mode: &str,
        table: &str,
        status: RunStatus,
    ) -> Self {
        Self {
            run_id: run_context.run_id.clone(),
            timestamp: run_context.start_time,
            duration_secs: metrics.elapsed_secs(),
            status,
            mode: mode.to_string(),
            table: table.to_string(),
            limits: EffectiveLimits::from_settings(settings),
            environment: EnvironmentInfo::gather(),
            performance: InsertStats::from_metrics(metrics),
        }
    }

    /// Writes the report as YAML, replacing any existing file at `path`.
    pub fn save_yaml(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize report to YAML")?;

        fs::write(path, yaml)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;

        Ok(())
    }
}
