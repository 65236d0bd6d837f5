//! wideskies-core: encrypted response computation for a Paillier-style PIR
//!
//! The querier sends one encrypted element per row. The responder hashes each
//! record's selector to a row, raises that row's element to the record's
//! chunk values, and multiplies everything landing in the same column. The
//! decrypting party recovers the chunks of the records it asked about; every
//! other row contributes encryptions of zero.
//!
//! # Pipeline
//!
//! | Stage | Module |
//! |-------|--------|
//! | Selector routing + hit cap | [`router`] |
//! | Exponentiation table (optional) | [`exp_table`] |
//! | Row aggregation | [`row`] |
//! | Column reduction | [`reducer`] |
//! | Response assembly | [`response`] |
//!
//! [`Responder`] wires the stages together; [`ResponderConfig`] selects the
//! strategies. All arithmetic is modulo `N^2`, the query's modulus.
//!
//! # Determinism
//!
//! For a fixed query and record multiset the response is the same for every
//! strategy combination, partition count and worker count. The one input
//! order dependency is the hit cap, which keeps the first records in input
//! order.

pub mod config;
pub mod error;
pub mod exp_table;
pub mod metrics;
pub mod query;
pub mod reducer;
pub mod responder;
pub mod response;
pub mod router;
pub mod row;
pub mod store;

pub use config::{ResponderConfig, RunPlan, TablePolicy, DEFAULT_DATA_PARTITIONS};
pub use error::{Boundary, Error, ErrorClass, Result, Stage};
pub use exp_table::{ExpTable, TableSource};
pub use metrics::Counters;
pub use query::{Embedding, Query, QueryInfo, MAX_CHUNK_BIT_SIZE};
pub use reducer::{ColumnReducer, ColumnReduction};
pub use responder::{Responder, RunOutput};
pub use response::Response;
pub use router::{row_index, HitLimit, Record, SelectorRouter};
pub use row::{ColumnPartial, RowAggregator, RowComputation};
pub use store::{FileStorage, Storage};
