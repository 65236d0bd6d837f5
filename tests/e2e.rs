//! End-to-end responder runs over small toy queries (N^2 = 3233)

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use num_bigint::BigUint;
use tempfile::tempdir;
use wideskies::{
    row_index, Boundary, ColumnReduction, Embedding, Error, ErrorClass, ExpTable, FileStorage,
    Query, QueryInfo, Record, Responder, ResponderConfig, Response, RowComputation, Stage, Storage,
    TableSource,
};

const MODULUS: u32 = 3233;

fn query(bases: &[u64], num_columns: u64, chunks_per_record: usize) -> Query {
    let info = QueryInfo {
        identifier: "e2e".into(),
        query_type: "email".into(),
        num_columns,
        num_rows: bases.len() as u64,
        hash_key: "e2e-key".into(),
        limit_hits_per_selector: false,
        max_hits_per_selector: 0,
        use_exp_lookup_table: false,
    };
    let elements = bases
        .iter()
        .enumerate()
        .map(|(row, &base)| (row as u64, BigUint::from(base)))
        .collect();
    Query::new(
        info,
        BigUint::from(MODULUS),
        Embedding::new(4, chunks_per_record),
        elements,
    )
}

/// Two selectors that hash to different rows
fn distinct_selectors(num_rows: u64) -> (String, String) {
    let first = "sel-0".to_string();
    let row = row_index("e2e-key", &first, num_rows).unwrap();
    let second = (1..)
        .map(|i| format!("sel-{i}"))
        .find(|s| row_index("e2e-key", s, num_rows).unwrap() != row)
        .unwrap();
    (first, second)
}

fn values(response: &Response) -> Vec<u64> {
    response
        .columns()
        .map(|(_, v)| u64::try_from(v).unwrap())
        .collect()
}

/// Storage that only fails
struct BrokenStorage;

impl Storage for BrokenStorage {
    fn load_query(&self, id: &str) -> wideskies::Result<Query> {
        Err(Error::Config(format!("no query {id}")))
    }

    fn load_exp_table(&self, _query_hash: &str) -> wideskies::Result<Option<ExpTable>> {
        Ok(None)
    }

    fn store_exp_table(&self, _table: &ExpTable) -> wideskies::Result<()> {
        Ok(())
    }

    fn store_response(&self, location: &Path, _response: &Response) -> wideskies::Result<()> {
        Err(Error::Storage {
            boundary: Boundary::Response,
            path: location.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        })
    }

    fn exp_table_dir(&self) -> Option<&Path> {
        None
    }
}

/// File storage whose table writes fail
struct ReadOnlyTables(FileStorage);

impl Storage for ReadOnlyTables {
    fn load_query(&self, id: &str) -> wideskies::Result<Query> {
        self.0.load_query(id)
    }

    fn load_exp_table(&self, query_hash: &str) -> wideskies::Result<Option<ExpTable>> {
        self.0.load_exp_table(query_hash)
    }

    fn store_exp_table(&self, table: &ExpTable) -> wideskies::Result<()> {
        Err(Error::Storage {
            boundary: Boundary::ExpTable,
            path: self
                .0
                .exp_table_path(table.query_hash())
                .unwrap_or_default(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
        })
    }

    fn store_response(&self, location: &Path, response: &Response) -> wideskies::Result<()> {
        self.0.store_response(location, response)
    }

    fn exp_table_dir(&self) -> Option<&Path> {
        self.0.exp_table_dir()
    }
}

fn persisted_config(table_dir: &Path, row_computation: RowComputation) -> ResponderConfig {
    ResponderConfig {
        use_precomputed_table: true,
        table_dir: Some(table_dir.to_path_buf()),
        row_computation,
        ..Default::default()
    }
}

#[test]
fn test_single_record_toy_scenario() {
    let dir = tempdir().unwrap();
    let responder = Responder::new(
        query(&[2], 1, 1),
        &ResponderConfig::default(),
        FileStorage::new(dir.path()),
    )
    .unwrap();

    let output = responder
        .compute(vec![Record::new("alice@example.com", vec![5])])
        .unwrap();

    assert_eq!(values(&output.response), vec![32]);
    assert_eq!(output.counters.records_retained(), 1);
    assert_eq!(output.counters.columns_with_data, 1);
    assert_eq!(output.table_source, None);
}

#[test]
fn test_rows_multiply_into_shared_column() {
    let (a, b) = distinct_selectors(4);
    let responder = Responder::new(
        query(&[2, 2, 2, 2], 2, 1),
        &ResponderConfig::default(),
        BrokenStorage,
    )
    .unwrap();

    let output = responder
        .compute(vec![Record::new(a, vec![5]), Record::new(b, vec![5])])
        .unwrap();

    // Both rows put their first record in column 0; column 1 is untouched
    assert_eq!(values(&output.response), vec![32 * 32 % 3233, 1]);
    assert_eq!(output.counters.rows_aggregated, 2);
}

#[test]
fn test_same_row_records_take_consecutive_columns() {
    let responder = Responder::new(
        query(&[2, 3, 5], 4, 2),
        &ResponderConfig::default(),
        BrokenStorage,
    )
    .unwrap();
    let row = row_index("e2e-key", "bob", 3).unwrap();
    let base = [2u64, 3, 5][row as usize];

    let output = responder
        .compute(vec![
            Record::new("bob", vec![1, 2]),
            Record::new("bob", vec![3, 0]),
        ])
        .unwrap();

    assert_eq!(
        values(&output.response),
        vec![base, base.pow(2), base.pow(3) % 3233, 1]
    );
}

#[test]
fn test_filtered_records_contribute_nothing() {
    let responder = Responder::new(
        query(&[2, 3], 3, 1),
        &ResponderConfig::default(),
        BrokenStorage,
    )
    .unwrap();

    let output = responder
        .compute((0..10).map(|i| Record::filtered(format!("s{i}"))))
        .unwrap();

    assert_eq!(values(&output.response), vec![1, 1, 1]);
    assert_eq!(output.counters.records_received, 10);
    assert_eq!(output.counters.records_filtered, 10);
    assert_eq!(output.counters.columns_with_data, 0);
}

#[test]
fn test_every_strategy_produces_the_same_response() {
    let bases: Vec<u64> = (0..16).map(|i| 2 + 7 * i).collect();
    let records: Vec<Record> = (0..80u64)
        .map(|i| {
            if i % 9 == 0 {
                Record::filtered(format!("user-{}", i % 20))
            } else {
                Record::new(format!("user-{}", i % 20), vec![i % 16, (i * 5) % 16])
            }
        })
        .collect();

    let mut baseline: Option<Response> = None;
    for row_computation in [RowComputation::Direct, RowComputation::PrecomputedJoin] {
        for column_reduction in [ColumnReduction::FoldInShuffle, ColumnReduction::GroupThenFold] {
            for num_data_partitions in [1, 3, 1000] {
                for num_threads in [None, Some(2)] {
                    let config = ResponderConfig {
                        num_data_partitions,
                        limit_hits_per_selector: Some(true),
                        max_hits_per_selector: Some(4),
                        row_computation,
                        column_reduction,
                        num_threads,
                        ..Default::default()
                    };
                    let responder =
                        Responder::new(query(&bases, 8, 2), &config, BrokenStorage).unwrap();
                    let output = responder.compute(records.clone()).unwrap();

                    assert_eq!(output.response.num_columns(), 8);
                    match &baseline {
                        None => baseline = Some(output.response),
                        Some(expected) => assert_eq!(
                            &output.response, expected,
                            "{row_computation:?} {column_reduction:?} p={num_data_partitions} t={num_threads:?}"
                        ),
                    }
                }
            }
        }
    }
}

#[test]
fn test_hit_limit_keeps_first_records_in_input_order() {
    let config = ResponderConfig {
        num_data_partitions: 4,
        limit_hits_per_selector: Some(true),
        max_hits_per_selector: Some(3),
        ..Default::default()
    };
    let responder = Responder::new(query(&[2, 3, 5, 7], 3, 1), &config, BrokenStorage).unwrap();
    let base = [2u64, 3, 5, 7][row_index("e2e-key", "hot", 4).unwrap() as usize];

    let output = responder
        .compute((1..=10).map(|i| Record::new("hot", vec![i])))
        .unwrap();

    // Chunks 1, 2, 3 survive; 4..=10 are dropped
    assert_eq!(values(&output.response), vec![base, base.pow(2), base.pow(3)]);
    assert_eq!(output.counters.hits_dropped, 7);
    assert_eq!(output.counters.selector_hits["hot"], 3);
    assert_eq!(output.counters.records_retained(), 3);
}

#[test]
fn test_persisted_table_is_reused() {
    let dir = tempdir().unwrap();
    let table_dir = dir.path().join("tables");
    let storage = FileStorage::new(dir.path()).with_table_dir(&table_dir);
    storage.store_query("q1", &query(&[2, 3, 5, 7], 4, 1)).unwrap();

    let config = ResponderConfig {
        use_precomputed_table: true,
        table_dir: Some(table_dir.clone()),
        row_computation: RowComputation::PrecomputedJoin,
        ..Default::default()
    };
    let records: Vec<Record> = (0..4).map(|i| Record::new(format!("r{i}"), vec![i * 3])).collect();

    let first = Responder::load("q1", &config, storage.clone()).unwrap();
    let out_first = first.compute(records.clone()).unwrap();
    assert_eq!(out_first.table_source, Some(TableSource::Computed));

    let hash = first.query().hash().unwrap();
    assert!(storage.exp_table_path(&hash).unwrap().exists());

    let second = Responder::load("q1", &config, storage).unwrap();
    let out_second = second.compute(records.clone()).unwrap();
    assert_eq!(out_second.table_source, Some(TableSource::Loaded));
    assert_eq!(out_first.response, out_second.response);

    let direct = Responder::load(
        "q1",
        &ResponderConfig::default(),
        FileStorage::new(dir.path()),
    )
    .unwrap();
    assert_eq!(direct.compute(records).unwrap().response, out_first.response);
}

#[test]
fn test_run_stores_response() {
    let dir = tempdir().unwrap();
    let storage = FileStorage::new(dir.path());
    let location = dir.path().join("out").join("response.bin");

    let responder =
        Responder::new(query(&[2], 2, 1), &ResponderConfig::default(), storage.clone()).unwrap();
    let output = responder
        .run(vec![Record::new("x", vec![5])], &location)
        .unwrap();

    let stored = storage.load_response(&location).unwrap();
    assert_eq!(stored, output.response);
    assert_eq!(values(&stored), vec![32, 1]);
    assert_eq!(stored.query_info().identifier, "e2e");
}

#[test]
fn test_failing_response_store_aborts_run() {
    let dir = tempdir().unwrap();
    let responder = Responder::new(query(&[2], 1, 1), &ResponderConfig::default(), BrokenStorage).unwrap();

    let err = responder
        .run(vec![Record::new("x", vec![5])], &dir.path().join("response.bin"))
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Response));
    assert_eq!(err.boundary(), Some(Boundary::Response));
    assert_eq!(err.class(), ErrorClass::Io);
}

#[test]
fn test_bad_record_aborts_before_anything_is_stored() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("response.bin");
    let responder = Responder::new(
        query(&[2, 3], 2, 1),
        &ResponderConfig::default(),
        FileStorage::new(dir.path()),
    )
    .unwrap();

    let err = responder
        .run(
            vec![Record::new("ok", vec![1]), Record::new("too-wide", vec![16])],
            &location,
        )
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Routing));
    assert_eq!(err.class(), ErrorClass::DataConsistency);
    assert_eq!(err.code(), "CHUNK_OUT_OF_RANGE");
    assert!(!location.exists());
}

#[test]
fn test_unlimited_overflow_is_column_error() {
    let responder = Responder::new(query(&[2], 2, 1), &ResponderConfig::default(), BrokenStorage).unwrap();

    let err = responder
        .compute((0..3).map(|i| Record::new("same", vec![i])))
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::RowAggregation));
    assert!(matches!(err.root(), Error::ColumnOutOfRange { column: 2, num_columns: 2 }));
}

#[test]
fn test_invalid_setup_fails_before_any_work() {
    let limit_zero = ResponderConfig {
        limit_hits_per_selector: Some(true),
        max_hits_per_selector: Some(0),
        ..Default::default()
    };
    let err = Responder::new(query(&[2], 1, 1), &limit_zero, BrokenStorage).err().unwrap();
    assert_eq!(err.class(), ErrorClass::Config);
    assert_eq!(err.stage(), None);

    let no_table_dir = ResponderConfig {
        use_precomputed_table: true,
        ..Default::default()
    };
    let err = Responder::new(query(&[2], 1, 1), &no_table_dir, BrokenStorage).err().unwrap();
    assert_eq!(err.class(), ErrorClass::Config);

    let mut wide = query(&[2], 1, 1);
    wide.embedding = Embedding::new(30, 1);
    let err = Responder::new(wide, &ResponderConfig::default(), BrokenStorage).err().unwrap();
    assert_eq!(err.code(), "INVALID_CONFIG");

    let mut outside = query(&[2], 1, 1);
    outside.elements = BTreeMap::from([(5, BigUint::from(2u32))]);
    assert!(Responder::new(outside, &ResponderConfig::default(), BrokenStorage).is_err());

    // Row 1 has no element: rejected up front, not when a record happens to land there
    let mut sparse = query(&[2, 3, 5], 1, 1);
    sparse.elements.remove(&1);
    let err = Responder::new(sparse, &ResponderConfig::default(), BrokenStorage).err().unwrap();
    assert_eq!(err.class(), ErrorClass::Config);
}

#[test]
fn test_table_dir_must_match_storage() {
    let dir = tempdir().unwrap();
    let config = persisted_config(&dir.path().join("tables"), RowComputation::PrecomputedJoin);

    // Storage without a table directory
    let err = Responder::new(query(&[2], 1, 1), &config, FileStorage::new(dir.path()))
        .err()
        .unwrap();
    assert_eq!(err.class(), ErrorClass::Config);
    assert_eq!(err.stage(), None);

    // Storage pointing somewhere else
    let elsewhere = FileStorage::new(dir.path()).with_table_dir(dir.path().join("other"));
    let err = Responder::new(query(&[2], 1, 1), &config, elsewhere).err().unwrap();
    assert_eq!(err.code(), "INVALID_CONFIG");

    // Non-file storage cannot persist tables at all
    assert!(Responder::new(query(&[2], 1, 1), &config, BrokenStorage).is_err());
    assert!(!dir.path().join("tables").exists());
}

#[test]
fn test_direct_mode_reuses_persisted_table() {
    let dir = tempdir().unwrap();
    let table_dir = dir.path().join("tables");
    let storage = FileStorage::new(dir.path()).with_table_dir(&table_dir);
    let config = persisted_config(&table_dir, RowComputation::Direct);
    let records: Vec<Record> = (0..6).map(|i| Record::new(format!("d{i}"), vec![15 - i])).collect();

    let first = Responder::new(query(&[2, 3, 5, 7], 6, 1), &config, storage.clone()).unwrap();
    let out_first = first.compute(records.clone()).unwrap();
    assert_eq!(out_first.table_source, Some(TableSource::Computed));

    let second = Responder::new(query(&[2, 3, 5, 7], 6, 1), &config, storage).unwrap();
    let out_second = second.compute(records.clone()).unwrap();
    assert_eq!(out_second.table_source, Some(TableSource::Loaded));

    let plain = Responder::new(
        query(&[2, 3, 5, 7], 6, 1),
        &ResponderConfig::default(),
        BrokenStorage,
    )
    .unwrap();
    let expected = plain.compute(records).unwrap().response;
    assert_eq!(out_first.response, expected);
    assert_eq!(out_second.response, expected);
}

#[test]
fn test_failing_table_store_aborts_run() {
    let dir = tempdir().unwrap();
    let table_dir = dir.path().join("tables");
    let storage = ReadOnlyTables(FileStorage::new(dir.path()).with_table_dir(&table_dir));
    let location = dir.path().join("response.bin");

    let responder = Responder::new(
        query(&[2, 3], 2, 1),
        &persisted_config(&table_dir, RowComputation::PrecomputedJoin),
        storage,
    )
    .unwrap();
    let err = responder
        .run(vec![Record::new("x", vec![5])], &location)
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::ExpTable));
    assert_eq!(err.boundary(), Some(Boundary::ExpTable));
    assert_eq!(err.class(), ErrorClass::Io);
    assert!(!location.exists());
}

#[test]
fn test_corrupt_persisted_table_aborts_run() {
    let dir = tempdir().unwrap();
    let table_dir = dir.path().join("tables");
    let storage = FileStorage::new(dir.path()).with_table_dir(&table_dir);
    let location = dir.path().join("response.bin");
    let query = query(&[2, 3], 2, 1);

    let table_path = storage.exp_table_path(&query.hash().unwrap()).unwrap();
    std::fs::create_dir_all(&table_dir).unwrap();
    std::fs::write(&table_path, b"\x07 not a table").unwrap();

    let responder = Responder::new(
        query,
        &persisted_config(&table_dir, RowComputation::Direct),
        storage,
    )
    .unwrap();
    let err = responder
        .run(vec![Record::new("x", vec![5])], &location)
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::ExpTable));
    assert_eq!(err.boundary(), Some(Boundary::ExpTable));
    assert_eq!(err.code(), "ENCODING_ERROR");
    assert!(!location.exists());
}

#[test]
fn test_missing_query_is_load_error() {
    let dir = tempdir().unwrap();
    let err = Responder::load("absent", &ResponderConfig::default(), FileStorage::new(dir.path()))
        .err()
        .unwrap();
    assert_eq!(err.boundary(), Some(Boundary::Query));
}
