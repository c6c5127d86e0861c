use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::CliOverrides;
use crate::table::TableRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Push rows through the batching queue as they are read
    Stream,
    /// Load all rows and insert them in one call with retries
    Insert,
}

#[derive(Parser, Debug)]
#[command(name = "stream_insert")]
#[command(about = "Batch NDJSON rows into a table store with partial-failure retry")]
#[command(version)]
pub struct Args {
    /// Path to config YAML file (default: config.yaml in root)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// NDJSON input file or glob (supports .ndjson.gz)
    /// Overrides config.yaml value if provided
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Destination as <dataset>.<table>
    #[arg(short, long)]
    pub table: Option<TableRef>,

    /// Root directory of the local table store
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Schema used to create the table if missing, e.g. "id:integer,name:string"
    #[arg(short, long)]
    pub schema: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Mode::Stream)]
    pub mode: Mode,

    /// Input lines are already {"insertId", "json"} rows
    #[arg(long)]
    pub raw: bool,

    /// Maximum rows per batch
    #[arg(long)]
    pub max_rows: Option<usize>,

    /// Maximum time a row waits before its batch is flushed
    #[arg(long)]
    pub max_delay_millis: Option<u64>,

    /// Extra attempts for rows rejected in a partial failure
    #[arg(long)]
    pub partial_retries: Option<u32>,

    /// Force the run id (directory name under runs/)
    #[arg(long)]
    pub run_id: Option<String>,
}

impl Args {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            input: self.input.clone(),
            store_dir: self.store_dir.clone(),
            table: self.table.clone(),
            schema: self.schema.clone(),
            max_rows: self.max_rows,
            max_delay_millis: self.max_delay_millis,
            partial_retries: self.partial_retries,
        }
    }
}
