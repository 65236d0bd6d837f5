//! Row aggregation: per-row ciphertext contributions to each column
//!
//! A row's base is the query element with the row's index. The `i`-th chunk
//! `c` of the `k`-th retained record contributes `base^c mod N^2` to column
//! `k * chunks_per_record + i`; contributions landing in the same column are
//! multiplied together. Columns a row does not touch are simply not emitted.
//!
//! The factor `base^c` comes from a [`PowerSource`]: computed inline (direct
//! mode, optionally cached per worker) or looked up in a precomputed
//! [`ExpTable`] (join mode). Direct mode given a persisted table reads its
//! powers from the table and computes only what the table lacks. Join mode
//! treats a missing entry as fatal. All variants produce identical partials.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use num_bigint::BigUint;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exp_table::{mod_pow, ExpTable};
use crate::metrics::Counters;
use crate::query::Query;
use crate::router::RowBucket;

/// Row computation strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowComputation {
    /// Modular exponentiation inline per row
    #[default]
    Direct,
    /// Join rows against the precomputed exponentiation table
    PrecomputedJoin,
}

/// One row's contribution to one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPartial {
    pub column: u64,
    pub value: BigUint,
}

impl ColumnPartial {
    pub fn new(column: u64, value: impl Into<BigUint>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

/// Supplier of `base^power mod N^2` factors for one worker
pub enum PowerSource<'a> {
    Direct {
        modulus: &'a BigUint,
        lookup: Option<&'a ExpTable>,
        cache: Option<HashMap<(u64, u64), BigUint>>,
    },
    Table(&'a ExpTable),
}

impl PowerSource<'_> {
    pub fn power(&mut self, element: u64, base: &BigUint, power: u64) -> Result<BigUint> {
        match self {
            PowerSource::Direct {
                modulus,
                lookup,
                cache,
            } => {
                if let Some(value) = lookup.and_then(|table| table.get(element, power)) {
                    return Ok(value.clone());
                }
                let modulus: &BigUint = modulus;
                Ok(match cache {
                    Some(cache) => cache
                        .entry((element, power))
                        .or_insert_with(|| mod_pow(base, power, modulus))
                        .clone(),
                    None => mod_pow(base, power, modulus),
                })
            }
            PowerSource::Table(table) => table.lookup(element, power).cloned(),
        }
    }
}

/// Computes column partials for row buckets
#[derive(Debug, Clone)]
pub struct RowAggregator {
    query: Arc<Query>,
    mode: RowComputation,
    table: Option<Arc<ExpTable>>,
    use_local_cache: bool,
}

impl RowAggregator {
    /// Direct mode, with an optional per-worker cache of computed powers
    pub fn direct(query: Arc<Query>, use_local_cache: bool) -> Self {
        Self {
            query,
            mode: RowComputation::Direct,
            table: None,
            use_local_cache,
        }
    }

    /// Precomputed-join mode
    pub fn precomputed(query: Arc<Query>, table: Arc<ExpTable>) -> Self {
        Self {
            query,
            mode: RowComputation::PrecomputedJoin,
            table: Some(table),
            use_local_cache: false,
        }
    }

    /// Let direct mode read powers from `table` before computing them
    pub fn with_lookup(mut self, table: Arc<ExpTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn mode(&self) -> RowComputation {
        self.mode
    }

    /// Fresh per-worker power source
    pub fn power_source(&self) -> PowerSource<'_> {
        match (self.mode, &self.table) {
            (RowComputation::PrecomputedJoin, Some(table)) => PowerSource::Table(table),
            (_, table) => PowerSource::Direct {
                modulus: &self.query.modulus,
                lookup: table.as_deref(),
                cache: self.use_local_cache.then(HashMap::new),
            },
        }
    }

    /// Partials for a single row, in ascending column order
    pub fn compute_row(
        &self,
        bucket: &RowBucket,
        source: &mut PowerSource<'_>,
    ) -> Result<Vec<ColumnPartial>> {
        let query = &self.query;
        let modulus = &query.modulus;
        let num_columns = query.info.num_columns;
        let base = query.element(bucket.row)?;

        let mut columns: BTreeMap<u64, BigUint> = BTreeMap::new();
        for (k, chunks) in bucket.records.iter().enumerate() {
            for (i, &chunk) in chunks.iter().enumerate() {
                let column = query.embedding.column_for(k, i);
                if column >= num_columns {
                    return Err(Error::ColumnOutOfRange {
                        column,
                        num_columns,
                    });
                }

                let factor = source.power(bucket.row, base, chunk)?;
                match columns.get_mut(&column) {
                    Some(acc) => *acc = (&*acc * &factor) % modulus,
                    None => {
                        columns.insert(column, factor);
                    }
                }
            }
        }

        Ok(columns
            .into_iter()
            .map(|(column, value)| ColumnPartial { column, value })
            .collect())
    }

    /// Aggregate every bucket exactly once across the rayon pool
    pub fn aggregate(&self, buckets: &[RowBucket]) -> Result<(Vec<ColumnPartial>, Counters)> {
        let per_row: Vec<Vec<ColumnPartial>> = buckets
            .par_iter()
            .map_init(
                || self.power_source(),
                |source, bucket| self.compute_row(bucket, source),
            )
            .collect::<Result<_>>()?;

        let mut counters = Counters::new();
        counters.rows_aggregated = per_row.len() as u64;
        let partials: Vec<ColumnPartial> = per_row.into_iter().flatten().collect();
        counters.column_partials = partials.len() as u64;

        tracing::debug!(
            mode = ?self.mode(),
            rows = counters.rows_aggregated,
            partials = counters.column_partials,
            "Aggregated rows"
        );

        Ok((partials, counters))
    }
}
