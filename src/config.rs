use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::InsertRequestOptions;
use crate::pipeline::batch::BatchLimits;
use crate::pipeline::provision::ProvisionPolicy;
use crate::pipeline::queue::QueueOptions;
use crate::schema::TableSchema;
use crate::table::{InsertRowsOptions, TableRef};

/// Root configuration structure with versioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Configuration schema version for compatibility tracking
    pub version: String,
    /// Input rows and the destination store
    pub storage: StorageConfig,
    /// Continuous queue limits
    #[serde(default)]
    pub batching: BatchingConfig,
    /// One-shot insert behaviour
    #[serde(default)]
    pub insert: InsertConfig,
    /// Table autoprovisioning
    #[serde(default)]
    pub provision: ProvisionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    /// File the settings were read from; `None` when running on defaults.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Storage configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// NDJSON input file or glob (supports .ndjson.gz)
    pub input_path: Option<PathBuf>,
    /// Root directory of the local table store
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    pub dataset: Option<String>,
    pub table: Option<String>,
    /// Read buffer size (bytes)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_max_delay_millis")]
    pub max_delay_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertConfig {
    #[serde(default = "default_partial_retries")]
    pub partial_retries: u32,
    #[serde(default = "default_true")]
    pub create_insert_id: bool,
    #[serde(default)]
    pub skip_invalid_rows: bool,
    #[serde(default)]
    pub ignore_unknown_values: bool,
    #[serde(default)]
    pub template_suffix: Option<String>,
    /// Compact schema (`"name:type,..."`) used to create a missing table
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default = "default_consistency_delay_millis")]
    pub consistency_delay_millis: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_provision_delay_millis")]
    pub max_delay_millis: u64,
    #[serde(default = "default_provision_attempts")]
    pub max_attempts: u32,
}

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Progress refresh interval in milliseconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_keep_runs")]
    pub keep_runs: usize,
}

// Default value functions
fn default_store_dir() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_buffer_size() -> usize {
    256 * 1024 // 256KB
}

fn default_max_rows() -> usize {
    100
}

fn default_max_bytes() -> usize {
    1024 * 1024
}

fn default_max_delay_millis() -> u64 {
    10
}

fn default_partial_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_consistency_delay_millis() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_provision_delay_millis() -> u64 {
    600_000
}

fn default_provision_attempts() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_progress_interval() -> u64 {
    200
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_keep_runs() -> usize {
    10
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            max_delay_millis: default_max_delay_millis(),
        }
    }
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            partial_retries: default_partial_retries(),
            create_insert_id: true,
            skip_invalid_rows: false,
            ignore_unknown_values: false,
            template_suffix: None,
            schema: None,
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            consistency_delay_millis: default_consistency_delay_millis(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_millis: default_max_provision_delay_millis(),
            max_attempts: default_provision_attempts(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            progress_interval_millis: default_progress_interval(),
        }
    }
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            keep_runs: default_keep_runs(),
        }
    }
}

/// CLI values that take precedence over the YAML file.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub input: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub table: Option<TableRef>,
    pub schema: Option<String>,
    pub max_rows: Option<usize>,
    pub max_delay_millis: Option<u64>,
    pub partial_retries: Option<u32>,
}

impl CliOverrides {
    /// Names of the settings these overrides replace.
    pub fn applied(&self) -> Vec<&'static str> {
        [
            ("input_path", self.input.is_some()),
            ("store_dir", self.store_dir.is_some()),
            ("table", self.table.is_some()),
            ("schema", self.schema.is_some()),
            ("max_rows", self.max_rows.is_some()),
            ("max_delay_millis", self.max_delay_millis.is_some()),
            ("partial_retries", self.partial_retries.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }
}

impl Settings {
    /// Load settings from a YAML file. Falls back to defaults if file is missing.
    /// Fails fast with clear error message if YAML parsing fails.
    pub fn load_from_yaml(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config.yaml"));

        let config_str = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).context(format!("Failed to read config file at {:?}", path)),
        };

        let mut settings = Self::from_yaml_str(&config_str)
            .with_context(|| format!("Failed to parse config at {:?}", path))?;
        settings.source = Some(path);
        Ok(settings)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("invalid YAML structure")
    }

    /// Settings are loaded before logging starts, so callers report this
    /// once the logger is up.
    pub fn version_warning(&self) -> Option<String> {
        (self.version != "1.0").then(|| {
            format!(
                "Config version mismatch: expected 1.0, got {}. Continuing with current schema.",
                self.version
            )
        })
    }

    /// Merge CLI arguments into settings, with CLI taking precedence
    pub fn merge_with_cli(mut self, cli: CliOverrides) -> Self {
        if let Some(input) = cli.input {
            self.storage.input_path = Some(input);
        }
        if let Some(store_dir) = cli.store_dir {
            self.storage.store_dir = store_dir;
        }
        if let Some(table) = cli.table {
            self.storage.dataset = Some(table.dataset);
            self.storage.table = Some(table.table);
        }
        if let Some(schema) = cli.schema {
            self.insert.schema = Some(schema);
        }
        if let Some(max_rows) = cli.max_rows {
            self.batching.max_rows = max_rows;
        }
        if let Some(delay) = cli.max_delay_millis {
            self.batching.max_delay_millis = delay;
        }
        if let Some(retries) = cli.partial_retries {
            self.insert.partial_retries = retries;
        }
        self
    }

    /// Resolve paths relative to the project root
    pub fn resolve_paths(&mut self, root: &Path) {
        self.storage.store_dir = resolve_path(&self.storage.store_dir, root);
        self.runs.runs_dir = resolve_path(&self.runs.runs_dir, root);
        if let Some(ref mut input_path) = self.storage.input_path {
            *input_path = resolve_path(input_path, root);
        }
    }

    /// Get the input path; error if not set
    pub fn input_path(&self) -> Result<&Path> {
        self.storage
            .input_path
            .as_deref()
            .ok_or_else(|| anyhow!("input_path is required (set via --input or config.yaml)"))
    }

    pub fn table_ref(&self) -> Result<TableRef> {
        match (&self.storage.dataset, &self.storage.table) {
            (Some(dataset), Some(table)) => Ok(TableRef::new(dataset, table)),
            _ => Err(anyhow!(
                "dataset and table are required (set via --table or config.yaml)"
            )),
        }
    }

    /// Effective limits: the configured ceiling clamped to the hard ceiling.
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits::new(
            self.batching.max_bytes,
            self.batching.max_rows,
            Duration::from_millis(self.batching.max_delay_millis),
        )
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            limits: self.batch_limits(),
            create_insert_id: self.insert.create_insert_id,
        }
    }

    pub fn request_options(&self) -> InsertRequestOptions {
        InsertRequestOptions {
            skip_invalid_rows: self.insert.skip_invalid_rows,
            ignore_unknown_values: self.insert.ignore_unknown_values,
            template_suffix: self.insert.template_suffix.clone(),
        }
    }

    pub fn insert_options(&self) -> Result<InsertRowsOptions> {
        let schema = self
            .insert
            .schema
            .as_deref()
            .map(str::parse::<TableSchema>)
            .transpose()
            .context("Failed to parse insert.schema")?;

        Ok(InsertRowsOptions {
            partial_retries: self.insert.partial_retries,
            create_insert_id: self.insert.create_insert_id,
            schema,
            request: self.request_options(),
        })
    }

    pub fn provision_policy(&self) -> ProvisionPolicy {
        ProvisionPolicy {
            consistency_delay: Duration::from_millis(self.provision.consistency_delay_millis),
            backoff_multiplier: self.provision.backoff_multiplier,
            max_delay: Duration::from_millis(self.provision.max_delay_millis),
            max_attempts: self.provision.max_attempts,
        }
    }

    /// Save a copy of the effective settings alongside a run.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize settings")?;
        fs::write(path, yaml)
            .with_context(|| format!("Failed to write config snapshot to {}", path.display()))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            storage: StorageConfig {
                input_path: None,
                store_dir: default_store_dir(),
                dataset: None,
                table: None,
                buffer_size: default_buffer_size(),
            },
            batching: BatchingConfig::default(),
            insert: InsertConfig::default(),
            provision: ProvisionConfig::default(),
            logging: LoggingConfig::default(),
            runs: RunsConfig::default(),
            source: None,
        }
    }
}

/// Resolve a path to be either relative to root or return as-is if absolute
fn resolve_path(path: &Path, root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
