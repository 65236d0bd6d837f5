//! Modular exponentiation table
//!
//! For every query element `e` with base `b`, the table holds
//! `(p, b^p mod N^2)` for each power `p` in `[0, 2^chunk_bit_size)`. Row
//! aggregation in precomputed-join mode reads every factor from here, so the
//! table is complete or the run does not start.
//!
//! Persisted tables are keyed by [`Query::hash`]; a later run of the same
//! query loads the table instead of recomputing it.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::Query;
use crate::store::Storage;

/// `base^power mod modulus` by square-and-multiply
pub fn mod_pow(base: &BigUint, power: u64, modulus: &BigUint) -> BigUint {
    base.modpow(&BigUint::from(power), modulus)
}

/// Where a prepared table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    /// Read from storage, no exponentiation performed
    Loaded,
    /// Computed during this run
    Computed,
}

/// Query element index -> ascending `(power, base^power mod N^2)` pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpTable {
    query_hash: String,
    entries: BTreeMap<u64, Vec<(u64, BigUint)>>,
}

impl ExpTable {
    /// Compute the full table for `query`, one rayon task per element
    pub fn compute(query: &Query, query_hash: String) -> Self {
        let num_powers = query.embedding.num_powers();
        let modulus = &query.modulus;

        let entries = query
            .elements
            .par_iter()
            .map(|(&element, base)| {
                let powers: Vec<(u64, BigUint)> = (0..num_powers)
                    .map(|power| (power, mod_pow(base, power, modulus)))
                    .collect();
                (element, powers)
            })
            .collect();

        Self {
            query_hash,
            entries,
        }
    }

    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    /// Number of query elements covered
    pub fn num_elements(&self) -> usize {
        self.entries.len()
    }

    /// Powers held for one element
    pub fn powers(&self, element: u64) -> Option<&[(u64, BigUint)]> {
        self.entries.get(&element).map(Vec::as_slice)
    }

    pub fn get(&self, element: u64, power: u64) -> Option<&BigUint> {
        let powers = self.entries.get(&element)?;
        // Dense tables index directly; fall back to a search otherwise
        match powers.get(power as usize) {
            Some((p, value)) if *p == power => Some(value),
            _ => powers
                .binary_search_by_key(&power, |(p, _)| *p)
                .ok()
                .map(|i| &powers[i].1),
        }
    }

    /// Like [`ExpTable::get`], but a miss is a data-consistency error
    pub fn lookup(&self, element: u64, power: u64) -> Result<&BigUint> {
        self.get(element, power)
            .ok_or(Error::MissingTableEntry { element, power })
    }

    /// Check that every element and power the query can ask for is present
    pub fn verify_covers(&self, query: &Query) -> Result<()> {
        let num_powers = query.embedding.num_powers();
        for &element in query.elements.keys() {
            if let Some(power) = (0..num_powers).find(|&p| self.get(element, p).is_none()) {
                return Err(Error::MissingTableEntry { element, power });
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn remove(&mut self, element: u64, power: u64) {
        if let Some(powers) = self.entries.get_mut(&element) {
            powers.retain(|(p, _)| *p != power);
        }
    }
}

/// Produce the table for `query`.
///
/// With a storage backend the table is loaded by query hash when present and
/// computed then persisted otherwise. Without one it is computed in memory.
pub fn prepare_table(
    query: &Query,
    storage: Option<&dyn Storage>,
) -> Result<(ExpTable, TableSource)> {
    let query_hash = query.hash()?;

    if let Some(storage) = storage {
        if let Some(table) = storage.load_exp_table(&query_hash)? {
            if table.query_hash() != query_hash {
                return Err(Error::TableMismatch {
                    expected: query_hash,
                    found: table.query_hash().to_string(),
                });
            }
            table.verify_covers(query)?;
            tracing::info!(
                query_hash = %query_hash,
                elements = table.num_elements(),
                "Loaded persisted exponentiation table"
            );
            return Ok((table, TableSource::Loaded));
        }
    }

    let start = std::time::Instant::now();
    let table = ExpTable::compute(query, query_hash);
    tracing::info!(
        query_hash = %table.query_hash(),
        elements = table.num_elements(),
        powers = query.embedding.num_powers(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Computed exponentiation table"
    );

    if let Some(storage) = storage {
        storage.store_exp_table(&table)?;
    }

    Ok((table, TableSource::Computed))
}
