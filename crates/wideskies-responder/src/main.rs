//! wideskies responder
//!
//! Loads a query, computes the encrypted response over a JSON-lines record
//! file and stores it.
//!
//! Usage:
//!   wideskies-responder \
//!     --query-dir queries --query-id q-2024-07 \
//!     --input records.jsonl --output response.bin \
//!     --config responder.json
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

mod input;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use wideskies_core::{ColumnReduction, FileStorage, Responder, ResponderConfig, RowComputation};

#[derive(Parser, Debug)]
#[command(name = "wideskies-responder")]
#[command(about = "Compute the encrypted PIR response for a query")]
struct Args {
    /// Directory holding serialized queries
    #[arg(long)]
    query_dir: PathBuf,

    /// Query id (file name under --query-dir)
    #[arg(long)]
    query_id: String,

    /// JSON-lines record file, `-` for stdin
    #[arg(long)]
    input: PathBuf,

    /// Where to write the response
    #[arg(long)]
    output: PathBuf,

    /// JSON responder config; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for persisted exponentiation tables
    #[arg(long)]
    table_dir: Option<PathBuf>,

    /// Build or reuse the persisted exponentiation table
    #[arg(long)]
    use_precomputed_table: bool,

    #[arg(long, value_enum)]
    row_computation: Option<RowMode>,

    #[arg(long, value_enum)]
    column_reduction: Option<ReductionMode>,

    /// Record partitions for routing
    #[arg(long)]
    num_data_partitions: Option<usize>,

    /// Worker threads (default: one per core)
    #[arg(long)]
    num_threads: Option<usize>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RowMode {
    Direct,
    PrecomputedJoin,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ReductionMode {
    FoldInShuffle,
    GroupThenFold,
}

impl From<RowMode> for RowComputation {
    fn from(mode: RowMode) -> Self {
        match mode {
            RowMode::Direct => RowComputation::Direct,
            RowMode::PrecomputedJoin => RowComputation::PrecomputedJoin,
        }
    }
}

impl From<ReductionMode> for ColumnReduction {
    fn from(mode: ReductionMode) -> Self {
        match mode {
            ReductionMode::FoldInShuffle => ColumnReduction::FoldInShuffle,
            ReductionMode::GroupThenFold => ColumnReduction::GroupThenFold,
        }
    }
}

impl Args {
    /// Config file (or defaults) with command-line overrides applied
    fn responder_config(&self) -> anyhow::Result<ResponderConfig> {
        let mut config = match &self.config {
            Some(path) => ResponderConfig::from_file(path)?,
            None => ResponderConfig::default(),
        };

        if let Some(dir) = &self.table_dir {
            config.table_dir = Some(dir.clone());
        }
        if self.use_precomputed_table {
            config.use_precomputed_table = true;
        }
        if let Some(mode) = self.row_computation {
            config.row_computation = mode.into();
        }
        if let Some(mode) = self.column_reduction {
            config.column_reduction = mode.into();
        }
        if let Some(n) = self.num_data_partitions {
            config.num_data_partitions = n;
        }
        if let Some(n) = self.num_threads {
            config.num_threads = Some(n);
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.responder_config().context("loading responder config")?;

    let mut storage = FileStorage::new(&args.query_dir);
    if let Some(dir) = &config.table_dir {
        storage = storage.with_table_dir(dir);
    }

    let responder = Responder::load(&args.query_id, &config, storage)
        .map_err(log_failure)
        .with_context(|| format!("preparing query {}", args.query_id))?;

    let records = input::read_records(&args.input)?;
    tracing::info!(records = records.len(), input = %args.input.display(), "Read records");

    let output = responder
        .run(records, &args.output)
        .map_err(log_failure)
        .context("computing response")?;

    tracing::info!(
        output = %args.output.display(),
        columns = output.response.num_columns(),
        retained = output.counters.records_retained(),
        "Done"
    );
    Ok(())
}

fn log_failure(err: wideskies_core::Error) -> wideskies_core::Error {
    tracing::error!(
        code = err.code(),
        class = ?err.class(),
        stage = ?err.stage(),
        boundary = ?err.boundary(),
        "{}",
        err
    );
    err
}
