//! Query and QueryInfo: the broadcast, read-only description of a PIR query
//!
//! The query generator (out of scope here) produces one ciphertext base per row
//! bucket. The responder never mutates a loaded query; it is wrapped in an
//! `Arc` and shared with every worker for the duration of a run.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};

use crate::error::{Boundary, Error, Result};

/// Largest supported chunk width; the exponentiation table holds
/// `2^chunk_bit_size` powers per element.
pub const MAX_CHUNK_BIT_SIZE: u32 = 24;

/// Query metadata handed back to the decrypting party with the response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInfo {
    /// Unique id assigned by the query generator
    pub identifier: String,
    /// Query schema name (e.g. "dns-hostname")
    pub query_type: String,
    /// Number of ciphertext columns in the response
    pub num_columns: u64,
    /// Number of row-hash buckets
    pub num_rows: u64,
    /// Key mixed into the selector hash
    pub hash_key: String,
    pub limit_hits_per_selector: bool,
    pub max_hits_per_selector: u32,
    /// Use (and persist) the precomputed exponentiation table
    pub use_exp_lookup_table: bool,
}

/// How a record's plaintext is split into numeric chunks and laid out in columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embedding {
    /// Every chunk value lies in `[0, 2^chunk_bit_size)`
    pub chunk_bit_size: u32,
    /// Number of chunks one embedded record produces
    pub chunks_per_record: usize,
}

impl Embedding {
    pub fn new(chunk_bit_size: u32, chunks_per_record: usize) -> Self {
        Self {
            chunk_bit_size,
            chunks_per_record,
        }
    }

    /// Number of distinct chunk values, i.e. powers needed per query element
    pub fn num_powers(&self) -> u64 {
        1u64 << self.chunk_bit_size
    }

    pub fn check_chunk(&self, value: u64) -> Result<()> {
        if value >= self.num_powers() {
            return Err(Error::ChunkOutOfRange {
                value,
                bits: self.chunk_bit_size,
            });
        }
        Ok(())
    }

    /// Column of the `chunk`-th chunk of the `record`-th retained record in a row
    pub fn column_for(&self, record: usize, chunk: usize) -> u64 {
        (record * self.chunks_per_record + chunk) as u64
    }
}

/// The encrypted query vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub info: QueryInfo,
    /// Ciphertext modulus N^2
    pub modulus: BigUint,
    pub embedding: Embedding,
    /// Query element index (row) -> ciphertext base
    pub elements: BTreeMap<u64, BigUint>,
}

impl Query {
    pub fn new(
        info: QueryInfo,
        modulus: BigUint,
        embedding: Embedding,
        elements: BTreeMap<u64, BigUint>,
    ) -> Self {
        Self {
            info,
            modulus,
            embedding,
            elements,
        }
    }

    /// Ciphertext base for a row
    pub fn element(&self, row: u64) -> Result<&BigUint> {
        self.elements
            .get(&row)
            .ok_or(Error::MissingQueryElement(row))
    }

    /// Reject queries the pipeline cannot run. Called before any record is read.
    pub fn validate(&self) -> Result<()> {
        let info = &self.info;
        if info.num_rows == 0 {
            return Err(Error::Config("query has zero row buckets".into()));
        }
        if info.num_columns == 0 {
            return Err(Error::Config("query has zero columns".into()));
        }
        if self.modulus <= BigUint::one() {
            return Err(Error::Config(format!(
                "modulus must be greater than 1, got {}",
                self.modulus
            )));
        }
        if self.embedding.chunk_bit_size == 0 || self.embedding.chunk_bit_size > MAX_CHUNK_BIT_SIZE
        {
            return Err(Error::Config(format!(
                "chunk_bit_size must be in 1..={}, got {}",
                MAX_CHUNK_BIT_SIZE, self.embedding.chunk_bit_size
            )));
        }
        if self.embedding.chunks_per_record == 0 {
            return Err(Error::Config("chunks_per_record must be positive".into()));
        }
        if let Some((&index, _)) = self.elements.range(info.num_rows..).next() {
            return Err(Error::Config(format!(
                "query element {} lies outside {} row buckets",
                index, info.num_rows
            )));
        }
        if self.elements.len() as u64 != info.num_rows {
            let missing = (0..info.num_rows)
                .find(|row| !self.elements.contains_key(row))
                .unwrap_or(0);
            return Err(Error::Config(format!(
                "query covers {} of {} rows; row {} has no element",
                self.elements.len(),
                info.num_rows,
                missing
            )));
        }
        Ok(())
    }

    /// Stable identity of this query, used to key the persisted table.
    ///
    /// blake3 over the bincode encoding; `elements` is a `BTreeMap`, so the
    /// encoding does not depend on insertion order.
    pub fn hash(&self) -> Result<String> {
        let bytes = bincode::serialize(self).map_err(|source| Error::Encoding {
            boundary: Boundary::ExpTable,
            source,
        })?;
        Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
    }
}
