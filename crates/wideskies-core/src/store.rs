//! Persistence boundaries: query load, exponentiation table, response
//!
//! Everything is bincode on disk. Writes go to a sibling temp file that is
//! renamed into place, so readers never observe a partially written table or
//! response.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Boundary, Error, Result};
use crate::exp_table::ExpTable;
use crate::query::Query;
use crate::response::Response;

/// File extension of persisted exponentiation tables
pub const EXP_TABLE_EXTENSION: &str = "exptable";

/// Durable storage used by a responder run
pub trait Storage: Send + Sync {
    /// Load a persisted query by caller-supplied id
    fn load_query(&self, id: &str) -> Result<Query>;

    /// Load the table persisted for `query_hash`, if any
    fn load_exp_table(&self, query_hash: &str) -> Result<Option<ExpTable>>;

    /// Persist a table under its query hash
    fn store_exp_table(&self, table: &ExpTable) -> Result<()>;

    /// Persist the final response at `location`
    fn store_response(&self, location: &Path, response: &Response) -> Result<()>;

    /// Directory persisted tables are read from and written to, if any
    fn exp_table_dir(&self) -> Option<&Path>;
}

/// Local-filesystem storage
#[derive(Debug, Clone)]
pub struct FileStorage {
    query_dir: PathBuf,
    table_dir: Option<PathBuf>,
}

impl FileStorage {
    /// Queries are resolved relative to `query_dir`
    pub fn new(query_dir: impl AsRef<Path>) -> Self {
        Self {
            query_dir: query_dir.as_ref().to_path_buf(),
            table_dir: None,
        }
    }

    /// Directory holding persisted exponentiation tables
    pub fn with_table_dir(mut self, table_dir: impl AsRef<Path>) -> Self {
        self.table_dir = Some(table_dir.as_ref().to_path_buf());
        self
    }

    pub fn query_path(&self, id: &str) -> PathBuf {
        self.query_dir.join(id)
    }

    pub fn exp_table_path(&self, query_hash: &str) -> Option<PathBuf> {
        self.table_dir
            .as_ref()
            .map(|dir| dir.join(format!("{query_hash}.{EXP_TABLE_EXTENSION}")))
    }

    /// Persist a query under `id` (used by fixtures and the query generator side)
    pub fn store_query(&self, id: &str, query: &Query) -> Result<PathBuf> {
        let path = self.query_path(id);
        write_bincode(&path, query, Boundary::Query)?;
        Ok(path)
    }

    /// Read back a stored response
    pub fn load_response(&self, location: &Path) -> Result<Response> {
        read_bincode(location, Boundary::Response)
    }
}

impl Storage for FileStorage {
    fn load_query(&self, id: &str) -> Result<Query> {
        let path = self.query_path(id);
        let query: Query = read_bincode(&path, Boundary::Query)?;
        tracing::info!(
            path = %path.display(),
            identifier = %query.info.identifier,
            elements = query.elements.len(),
            "Loaded query"
        );
        Ok(query)
    }

    fn load_exp_table(&self, query_hash: &str) -> Result<Option<ExpTable>> {
        let Some(path) = self.exp_table_path(query_hash) else {
            return Ok(None);
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No persisted exponentiation table");
            return Ok(None);
        }
        read_bincode(&path, Boundary::ExpTable).map(Some)
    }

    fn store_exp_table(&self, table: &ExpTable) -> Result<()> {
        let path = self.exp_table_path(table.query_hash()).ok_or_else(|| {
            Error::Config("storing an exponentiation table requires a table directory".into())
        })?;
        write_bincode(&path, table, Boundary::ExpTable)?;
        tracing::info!(path = %path.display(), "Persisted exponentiation table");
        Ok(())
    }

    fn store_response(&self, location: &Path, response: &Response) -> Result<()> {
        write_bincode(location, response, Boundary::Response)?;
        tracing::info!(
            path = %location.display(),
            columns = response.num_columns(),
            "Stored response"
        );
        Ok(())
    }

    fn exp_table_dir(&self) -> Option<&Path> {
        self.table_dir.as_deref()
    }
}

fn read_bincode<T: DeserializeOwned>(path: &Path, boundary: Boundary) -> Result<T> {
    let data = fs::read(path).map_err(|source| Error::Storage {
        boundary,
        path: path.to_path_buf(),
        source,
    })?;
    bincode::deserialize(&data).map_err(|source| Error::Encoding { boundary, source })
}

fn write_bincode<T: Serialize>(path: &Path, value: &T, boundary: Boundary) -> Result<()> {
    let data = bincode::serialize(value).map_err(|source| Error::Encoding { boundary, source })?;
    write_atomic(path, &data).map_err(|source| Error::Storage {
        boundary,
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(data)?;
        file.sync_all()
    });

    match written.and_then(|()| fs::rename(&tmp, path)) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err)
        }
    }
}
