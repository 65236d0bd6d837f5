//! Responder configuration
//!
//! Settings come from a JSON file (every field optional, unknown fields
//! rejected) and are resolved against the query's `QueryInfo` into a
//! [`RunPlan`]. All validation happens here, before any record is read.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::{Embedding, QueryInfo};
use crate::reducer::ColumnReduction;
use crate::router::HitLimit;
use crate::row::RowComputation;

/// Default number of record partitions
pub const DEFAULT_DATA_PARTITIONS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponderConfig {
    /// Partitions records are split into for routing
    pub num_data_partitions: usize,
    /// Partitions for column reduction; defaults to `num_data_partitions`
    pub num_column_partitions: Option<usize>,
    /// Overrides `QueryInfo::limit_hits_per_selector`
    pub limit_hits_per_selector: Option<bool>,
    /// Overrides `QueryInfo::max_hits_per_selector`
    pub max_hits_per_selector: Option<u32>,
    /// Build or load the persisted exponentiation table
    pub use_precomputed_table: bool,
    /// Where persisted tables live
    pub table_dir: Option<PathBuf>,
    pub column_reduction: ColumnReduction,
    pub row_computation: RowComputation,
    /// Cache computed powers per worker in direct mode
    pub use_local_cache: bool,
    /// Worker pool size; rayon's default when unset
    pub num_threads: Option<usize>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            num_data_partitions: DEFAULT_DATA_PARTITIONS,
            num_column_partitions: None,
            limit_hits_per_selector: None,
            max_hits_per_selector: None,
            use_precomputed_table: false,
            table_dir: None,
            column_reduction: ColumnReduction::default(),
            row_computation: RowComputation::default(),
            use_local_cache: true,
            num_threads: None,
        }
    }
}

/// How the exponentiation table is obtained for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePolicy {
    /// No table; direct mode computes every power itself
    None,
    /// Computed for this run only
    InMemory,
    /// Loaded from, or computed and written to, the table directory
    Persisted,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub num_data_partitions: usize,
    pub num_column_partitions: usize,
    pub hit_limit: HitLimit,
    pub table: TablePolicy,
    /// Set whenever `table` is `Persisted`
    pub table_dir: Option<PathBuf>,
    pub row_computation: RowComputation,
    pub column_reduction: ColumnReduction,
    pub use_local_cache: bool,
    pub num_threads: Option<usize>,
}

impl ResponderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("malformed config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Resolve this config against a query
    pub fn plan(&self, info: &QueryInfo, embedding: &Embedding) -> Result<RunPlan> {
        if self.num_data_partitions == 0 {
            return Err(Error::Config("num_data_partitions must be positive".into()));
        }
        let num_column_partitions = self.num_column_partitions.unwrap_or(self.num_data_partitions);
        if num_column_partitions == 0 {
            return Err(Error::Config("num_column_partitions must be positive".into()));
        }
        if self.num_threads == Some(0) {
            return Err(Error::Config("num_threads must be positive".into()));
        }

        let hit_limit = self.hit_limit(info, embedding)?;

        let persisted = self.use_precomputed_table || info.use_exp_lookup_table;
        if persisted && self.table_dir.is_none() {
            return Err(Error::Config(
                "precomputed exponentiation table enabled but table_dir is not set".into(),
            ));
        }
        let table = if persisted {
            TablePolicy::Persisted
        } else if self.row_computation == RowComputation::PrecomputedJoin {
            TablePolicy::InMemory
        } else {
            TablePolicy::None
        };

        Ok(RunPlan {
            num_data_partitions: self.num_data_partitions,
            num_column_partitions,
            hit_limit,
            table,
            table_dir: self.table_dir.clone(),
            row_computation: self.row_computation,
            column_reduction: self.column_reduction,
            use_local_cache: self.use_local_cache,
            num_threads: self.num_threads,
        })
    }

    fn hit_limit(&self, info: &QueryInfo, embedding: &Embedding) -> Result<HitLimit> {
        let enabled = self
            .limit_hits_per_selector
            .unwrap_or(info.limit_hits_per_selector);
        if !enabled {
            return Ok(HitLimit::Unlimited);
        }

        let max_hits = self.max_hits_per_selector.unwrap_or(info.max_hits_per_selector);
        if max_hits == 0 {
            return Err(Error::Config(
                "hit limiting enabled with max_hits_per_selector = 0".into(),
            ));
        }

        let footprint = u64::from(max_hits) * embedding.chunks_per_record as u64;
        if footprint > info.num_columns {
            return Err(Error::Config(format!(
                "{} hits x {} chunks need {} columns, query has {}",
                max_hits, embedding.chunks_per_record, footprint, info.num_columns
            )));
        }

        Ok(HitLimit::PerSelector(max_hits))
    }
}
