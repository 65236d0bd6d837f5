//! Selector routing: maps qualifying records to row buckets
//!
//! Routing runs independently per data partition. The partitions are then
//! shuffled by row index, and the hit cap is applied once every record of a row
//! is in one place, which makes the cap exact regardless of partitioning.
//!
//! ## Hit limiting
//!
//! The cap is keyed by hashed selector, i.e. by row bucket. Records are
//! restored to input order before the cap is applied, so the retained records
//! are always the first `max_hits` seen for that row. Selectors that collide on
//! a row share its cap.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

use crate::error::{Error, Result};
use crate::metrics::Counters;
use crate::query::Query;

/// One record as delivered by the schema/stop-list collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Selector value the record is classified by
    pub selector: String,
    /// Keep decision from the stop-list filter
    #[serde(default = "default_keep")]
    pub keep: bool,
    /// Embedded numeric chunks
    #[serde(default)]
    pub chunks: Vec<u64>,
}

fn default_keep() -> bool {
    true
}

impl Record {
    pub fn new(selector: impl Into<String>, chunks: Vec<u64>) -> Self {
        Self {
            selector: selector.into(),
            keep: true,
            chunks,
        }
    }

    pub fn filtered(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            keep: false,
            chunks: Vec::new(),
        }
    }
}

/// Hash a selector to its row bucket.
///
/// keccak256(len(hash_key) || hash_key || selector), first 8 bytes read as a
/// little-endian u64, reduced mod `num_rows`. Returns `None` if `num_rows == 0`.
pub fn row_index(hash_key: &str, selector: &str, num_rows: u64) -> Option<u64> {
    if num_rows == 0 {
        return None;
    }

    let mut hasher = Keccak::v256();
    hasher.update(&(hash_key.len() as u64).to_le_bytes());
    hasher.update(hash_key.as_bytes());
    hasher.update(selector.as_bytes());

    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash[..8]);
    Some(u64::from_le_bytes(prefix) % num_rows)
}

/// Per-selector hit cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLimit {
    Unlimited,
    PerSelector(u32),
}

impl HitLimit {
    fn allows(&self, hits: u64) -> bool {
        match self {
            HitLimit::Unlimited => true,
            HitLimit::PerSelector(max) => hits < u64::from(*max),
        }
    }
}

/// A record after routing, tagged with its position in the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedRecord {
    pub seq: u64,
    pub row: u64,
    pub selector: String,
    pub chunks: Vec<u64>,
}

/// Routed records of one data partition, keyed by row
pub type RowPartition = HashMap<u64, Vec<RoutedRecord>>;

/// A row index and the chunk vectors of every record retained for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowBucket {
    pub row: u64,
    pub records: Vec<Vec<u64>>,
}

impl RowBucket {
    pub fn new(row: u64, records: Vec<Vec<u64>>) -> Self {
        Self { row, records }
    }
}

/// Routes records of a query to row buckets
#[derive(Debug, Clone)]
pub struct SelectorRouter {
    query: Arc<Query>,
}

impl SelectorRouter {
    pub fn new(query: Arc<Query>) -> Self {
        Self { query }
    }

    /// Row bucket for a selector value
    pub fn row_for(&self, selector: &str) -> u64 {
        let info = &self.query.info;
        // num_rows > 0 is checked by Query::validate
        row_index(&info.hash_key, selector, info.num_rows).unwrap_or(0)
    }

    /// Route a single record. Returns `None` for records the filter dropped.
    pub fn route(
        &self,
        seq: u64,
        record: &Record,
        counters: &mut Counters,
    ) -> Result<Option<RoutedRecord>> {
        counters.records_received += 1;
        if !record.keep {
            counters.records_filtered += 1;
            return Ok(None);
        }

        let embedding = &self.query.embedding;
        if record.chunks.len() != embedding.chunks_per_record {
            return Err(Error::ChunkCount {
                expected: embedding.chunks_per_record,
                actual: record.chunks.len(),
            });
        }
        for &chunk in &record.chunks {
            embedding.check_chunk(chunk)?;
        }

        counters.records_after_filter += 1;
        Ok(Some(RoutedRecord {
            seq,
            row: self.row_for(&record.selector),
            selector: record.selector.clone(),
            chunks: record.chunks.clone(),
        }))
    }

    /// Route one data partition of `(seq, record)` pairs
    pub fn route_partition(&self, partition: &[(u64, Record)]) -> Result<(RowPartition, Counters)> {
        let mut rows = RowPartition::new();
        let mut counters = Counters::new();

        for (seq, record) in partition {
            if let Some(routed) = self.route(*seq, record, &mut counters)? {
                rows.entry(routed.row).or_default().push(routed);
            }
        }

        Ok((rows, counters))
    }
}

/// Redistribute partition outputs by row index
pub fn shuffle_rows(partitions: Vec<RowPartition>) -> BTreeMap<u64, Vec<RoutedRecord>> {
    let mut rows: BTreeMap<u64, Vec<RoutedRecord>> = BTreeMap::new();
    for partition in partitions {
        for (row, records) in partition {
            rows.entry(row).or_default().extend(records);
        }
    }
    rows
}

/// Apply the hit cap to every record of one row
pub fn limit_row(row: u64, mut records: Vec<RoutedRecord>, limit: HitLimit) -> (RowBucket, Counters) {
    records.sort_unstable_by_key(|r| r.seq);

    let mut counters = Counters::new();
    let mut retained = Vec::with_capacity(records.len());
    for record in records {
        if limit.allows(retained.len() as u64) {
            counters.record_hit(&record.selector);
            retained.push(record.chunks);
        } else {
            counters.hits_dropped += 1;
        }
    }

    if counters.hits_dropped > 0 {
        tracing::debug!(row, dropped = counters.hits_dropped, "Hit limit reached");
    }

    (RowBucket::new(row, retained), counters)
}

/// Shuffle routed partitions into row buckets, applying the hit cap per row
pub fn build_buckets(partitions: Vec<RowPartition>, limit: HitLimit) -> (Vec<RowBucket>, Counters) {
    shuffle_rows(partitions)
        .into_par_iter()
        .map(|(row, records)| limit_row(row, records, limit))
        .fold(
            || (Vec::new(), Counters::new()),
            |(mut buckets, counters), (bucket, row_counters)| {
                buckets.push(bucket);
                (buckets, counters.merge(row_counters))
            },
        )
        .reduce(
            || (Vec::new(), Counters::new()),
            |(mut a, ca), (b, cb)| {
                a.extend(b);
                (a, ca.merge(cb))
            },
        )
}
