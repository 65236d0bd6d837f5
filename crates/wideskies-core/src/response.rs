//! Response assembly
//!
//! The response carries one ciphertext for every column index in
//! `[0, num_columns)`. Columns no row contributed to hold 1, the multiplicative
//! identity the decrypting party reads as "no data".

use std::collections::BTreeMap;

use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::QueryInfo;

/// Final encrypted response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    query_info: QueryInfo,
    columns: BTreeMap<u64, BigUint>,
}

impl Response {
    /// Complete the reduced columns and pair them with the query info.
    ///
    /// Fails if a reduced column lies outside `[0, num_columns)`.
    pub fn assemble(query_info: QueryInfo, reduced: BTreeMap<u64, BigUint>) -> Result<Self> {
        let num_columns = query_info.num_columns;
        if let Some((&column, _)) = reduced.range(num_columns..).next() {
            return Err(Error::ColumnOutOfRange {
                column,
                num_columns,
            });
        }

        let mut columns = reduced;
        for column in 0..num_columns {
            columns.entry(column).or_insert_with(BigUint::one);
        }

        for (column, value) in &columns {
            tracing::trace!(column, value = %value, "Response column");
        }

        Ok(Self {
            query_info,
            columns,
        })
    }

    pub fn query_info(&self) -> &QueryInfo {
        &self.query_info
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, index: u64) -> Option<&BigUint> {
        self.columns.get(&index)
    }

    /// Columns in ascending index order
    pub fn columns(&self) -> impl Iterator<Item = (u64, &BigUint)> + '_ {
        self.columns.iter().map(|(&i, v)| (i, v))
    }

    /// Number of columns holding something other than the identity
    pub fn columns_with_data(&self) -> usize {
        self.columns.values().filter(|v| !v.is_one()).count()
    }
}
