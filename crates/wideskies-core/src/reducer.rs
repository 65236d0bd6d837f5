//! Column reduction: fold column partials into one ciphertext per column
//!
//! Modular multiplication is commutative and associative, so the result
//! depends only on the multiset of partials, never on their order or on how
//! they were partitioned.

use std::collections::{BTreeMap, HashMap};

use num_bigint::BigUint;
use num_traits::One;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::row::ColumnPartial;

/// Column reduction strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnReduction {
    /// Pre-fold per partition while shuffling, then merge the partition maps
    FoldInShuffle,
    /// Group partials by column, then fold each group sequentially
    #[default]
    GroupThenFold,
}

/// Fold a column's values starting from the identity
pub fn fold_column<'a, I>(values: I, modulus: &BigUint) -> BigUint
where
    I: IntoIterator<Item = &'a BigUint>,
{
    values
        .into_iter()
        .fold(BigUint::one() % modulus, |acc, v| (acc * v) % modulus)
}

/// Reduces partials with the configured strategy
#[derive(Debug, Clone)]
pub struct ColumnReducer {
    modulus: BigUint,
    strategy: ColumnReduction,
    num_partitions: usize,
}

impl ColumnReducer {
    pub fn new(modulus: BigUint, strategy: ColumnReduction, num_partitions: usize) -> Self {
        Self {
            modulus,
            strategy,
            num_partitions: num_partitions.max(1),
        }
    }

    pub fn strategy(&self) -> ColumnReduction {
        self.strategy
    }

    /// Column -> folded ciphertext, for columns that received partials
    pub fn reduce(&self, partials: Vec<ColumnPartial>) -> BTreeMap<u64, BigUint> {
        let reduced = match self.strategy {
            ColumnReduction::FoldInShuffle => self.fold_in_shuffle(&partials),
            ColumnReduction::GroupThenFold => self.group_then_fold(partials),
        };
        tracing::debug!(
            strategy = ?self.strategy,
            partitions = self.num_partitions,
            columns = reduced.len(),
            "Reduced columns"
        );
        reduced
    }

    fn fold_in_shuffle(&self, partials: &[ColumnPartial]) -> BTreeMap<u64, BigUint> {
        let modulus = &self.modulus;
        let chunk_len = partials.len().div_ceil(self.num_partitions).max(1);

        let merged = partials
            .par_chunks(chunk_len)
            .map(|chunk| {
                let mut local: HashMap<u64, BigUint> = HashMap::new();
                for partial in chunk {
                    mul_into(&mut local, partial.column, &partial.value, modulus);
                }
                local
            })
            .reduce(HashMap::new, |mut a, b| {
                for (column, value) in b {
                    mul_into(&mut a, column, &value, modulus);
                }
                a
            });

        merged.into_iter().collect()
    }

    fn group_then_fold(&self, partials: Vec<ColumnPartial>) -> BTreeMap<u64, BigUint> {
        let modulus = &self.modulus;
        let n = self.num_partitions as u64;

        let mut partitions: Vec<HashMap<u64, Vec<BigUint>>> =
            (0..self.num_partitions).map(|_| HashMap::new()).collect();
        for partial in partials {
            partitions[(partial.column % n) as usize]
                .entry(partial.column)
                .or_default()
                .push(partial.value);
        }

        partitions
            .into_par_iter()
            .flat_map_iter(|groups| {
                groups
                    .into_iter()
                    .map(|(column, values)| (column, fold_column(&values, modulus)))
            })
            .collect()
    }
}

fn mul_into(acc: &mut HashMap<u64, BigUint>, column: u64, value: &BigUint, modulus: &BigUint) {
    match acc.get_mut(&column) {
        Some(current) => *current = (&*current * value) % modulus,
        None => {
            acc.insert(column, value % modulus);
        }
    }
}
