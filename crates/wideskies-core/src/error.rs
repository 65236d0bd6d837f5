//! Responder error types
//!
//! Every failure in the aggregation core is fatal to the run. The variants are
//! grouped into three classes (configuration, data consistency, I/O); hit-limit
//! drops are counted, never raised.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Persistence boundary that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Query,
    ExpTable,
    Response,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Query => write!(f, "query load"),
            Boundary::ExpTable => write!(f, "exponentiation table"),
            Boundary::Response => write!(f, "response store"),
        }
    }
}

/// Pipeline stage a mid-run error originated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Routing,
    ExpTable,
    RowAggregation,
    Response,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Routing => write!(f, "selector routing"),
            Stage::ExpTable => write!(f, "exponentiation table"),
            Stage::RowAggregation => write!(f, "row aggregation"),
            Stage::Response => write!(f, "response assembly"),
        }
    }
}

/// Coarse error class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Config,
    DataConsistency,
    Io,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Missing exponentiation table entry for query element {element}, power {power}")]
    MissingTableEntry { element: u64, power: u64 },

    #[error("Exponentiation table was built for query {found}, expected {expected}")]
    TableMismatch { expected: String, found: String },

    #[error("Query has no element for row {0}")]
    MissingQueryElement(u64),

    #[error("Chunk value {value} does not fit in a {bits}-bit embedding")]
    ChunkOutOfRange { value: u64, bits: u32 },

    #[error("Record embeds {actual} chunks, query expects {expected}")]
    ChunkCount { expected: usize, actual: usize },

    #[error("Column {column} out of range (query has {num_columns} columns)")]
    ColumnOutOfRange { column: u64, num_columns: u64 },

    #[error("{boundary} I/O failed at {}: {source}", path.display())]
    Storage {
        boundary: Boundary,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{boundary} encoding failed: {source}")]
    Encoding {
        boundary: Boundary,
        #[source]
        source: bincode::Error,
    },

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Tag this error with the stage it surfaced in. Already-tagged errors keep
    /// their original stage.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Stage the error originated in, if it was raised mid-run
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The untagged error underneath any stage wrapper
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.root() {
            Error::Config(_) => ErrorClass::Config,
            Error::MissingTableEntry { .. }
            | Error::TableMismatch { .. }
            | Error::MissingQueryElement(_)
            | Error::ChunkOutOfRange { .. }
            | Error::ChunkCount { .. }
            | Error::ColumnOutOfRange { .. } => ErrorClass::DataConsistency,
            Error::Storage { .. } | Error::Encoding { .. } => ErrorClass::Io,
            Error::Stage { .. } => unreachable!("root() strips stage wrappers"),
        }
    }

    /// Stable code for log lines and exit reporting
    pub fn code(&self) -> &'static str {
        match self.root() {
            Error::Config(_) => "INVALID_CONFIG",
            Error::MissingTableEntry { .. } => "MISSING_TABLE_ENTRY",
            Error::TableMismatch { .. } => "EXP_TABLE_MISMATCH",
            Error::MissingQueryElement(_) => "MISSING_QUERY_ELEMENT",
            Error::ChunkOutOfRange { .. } => "CHUNK_OUT_OF_RANGE",
            Error::ChunkCount { .. } => "CHUNK_COUNT_MISMATCH",
            Error::ColumnOutOfRange { .. } => "COLUMN_OUT_OF_RANGE",
            Error::Storage { .. } => "STORAGE_ERROR",
            Error::Encoding { .. } => "ENCODING_ERROR",
            Error::Stage { .. } => unreachable!("root() strips stage wrappers"),
        }
    }

    /// Persistence boundary behind an I/O error
    pub fn boundary(&self) -> Option<Boundary> {
        match self.root() {
            Error::Storage { boundary, .. } | Error::Encoding { boundary, .. } => Some(*boundary),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
