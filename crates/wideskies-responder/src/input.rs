//! Record input: one JSON object per line
//!
//! `{"selector": "alice@example.com", "keep": true, "chunks": [3, 14]}`
//!
//! `keep` defaults to true and `chunks` to empty. Blank lines are skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use wideskies_core::Record;

/// Read records from `path`, or from stdin when `path` is `-`
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    if path.as_os_str() == "-" {
        return parse_records(io::stdin().lock()).context("reading records from stdin");
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    parse_records(BufReader::new(file)).with_context(|| format!("reading {}", path.display()))
}

pub fn parse_records<R: BufRead>(reader: R) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: Record =
            serde_json::from_str(line).with_context(|| format!("line {}: malformed record", i + 1))?;
        records.push(record);
    }
    Ok(records)
}
