//! Responder pipeline
//!
//! records -> route (per data partition) -> shuffle by row + hit cap
//!         -> row aggregation (direct or table join) -> column reduction
//!         -> response assembly -> store
//!
//! When a table is needed it is prepared concurrently with routing. Any error
//! aborts the run; nothing is stored unless the whole response was computed.

use std::path::Path;
use std::sync::Arc;

use rayon::prelude::*;

use crate::config::{ResponderConfig, RunPlan, TablePolicy};
use crate::error::{Error, Result, Stage};
use crate::exp_table::{prepare_table, ExpTable, TableSource};
use crate::metrics::Counters;
use crate::query::Query;
use crate::reducer::ColumnReducer;
use crate::response::Response;
use crate::router::{build_buckets, Record, RowBucket, RowPartition, SelectorRouter};
use crate::row::{RowAggregator, RowComputation};
use crate::store::Storage;

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub response: Response,
    pub counters: Counters,
    /// Set when the run used an exponentiation table
    pub table_source: Option<TableSource>,
}

/// Computes the response for one query
pub struct Responder<S: Storage> {
    query: Arc<Query>,
    plan: RunPlan,
    storage: S,
    pool: Option<rayon::ThreadPool>,
}

impl<S: Storage> Responder<S> {
    /// Validate the query and config; no record is touched before this succeeds
    pub fn new(query: Query, config: &ResponderConfig, storage: S) -> Result<Self> {
        query.validate()?;
        let plan = config.plan(&query.info, &query.embedding)?;
        check_table_dir(&plan, &storage)?;

        let pool = plan
            .num_threads
            .map(|n| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("wideskies-worker-{i}"))
                    .build()
                    .map_err(|e| Error::Config(format!("cannot build worker pool: {e}")))
            })
            .transpose()?;

        tracing::info!(
            identifier = %query.info.identifier,
            query_type = %query.info.query_type,
            rows = query.info.num_rows,
            columns = query.info.num_columns,
            row_computation = ?plan.row_computation,
            column_reduction = ?plan.column_reduction,
            table = ?plan.table,
            hit_limit = ?plan.hit_limit,
            "Responder configured"
        );

        Ok(Self {
            query: Arc::new(query),
            plan,
            storage,
            pool,
        })
    }

    /// Load the query through `storage`, then configure as [`Responder::new`]
    pub fn load(query_id: &str, config: &ResponderConfig, storage: S) -> Result<Self> {
        let query = storage.load_query(query_id)?;
        Self::new(query, config, storage)
    }

    pub fn query(&self) -> &Arc<Query> {
        &self.query
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Compute the response without persisting it
    pub fn compute<I>(&self, records: I) -> Result<RunOutput>
    where
        I: IntoIterator<Item = Record>,
    {
        let records: Vec<(u64, Record)> = records
            .into_iter()
            .enumerate()
            .map(|(seq, record)| (seq as u64, record))
            .collect();

        self.install(|| self.compute_numbered(&records))
    }

    /// Compute the response, store it at `location` and publish the counters
    pub fn run<I>(&self, records: I, location: &Path) -> Result<RunOutput>
    where
        I: IntoIterator<Item = Record>,
    {
        let output = self.compute(records)?;
        self.storage
            .store_response(location, &output.response)
            .map_err(|e| e.in_stage(Stage::Response))?;
        output.counters.publish();
        Ok(output)
    }

    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    fn compute_numbered(&self, records: &[(u64, Record)]) -> Result<RunOutput> {
        let start = std::time::Instant::now();

        let (table, routed) = rayon::join(|| self.prepare_table(), || self.route(records));
        let table = table.map_err(|e| e.in_stage(Stage::ExpTable))?;
        let (buckets, counters) = routed.map_err(|e| e.in_stage(Stage::Routing))?;
        tracing::info!(
            records = records.len(),
            rows = buckets.len(),
            "Routed records to row buckets"
        );

        let table_source = table.as_ref().map(|(_, source)| *source);
        let aggregator = match (self.plan.row_computation, table) {
            (RowComputation::PrecomputedJoin, Some((table, _))) => {
                RowAggregator::precomputed(self.query.clone(), table)
            }
            (RowComputation::PrecomputedJoin, None) => {
                return Err(Error::Config(
                    "precomputed join requested without an exponentiation table".into(),
                ))
            }
            (RowComputation::Direct, table) => {
                let aggregator =
                    RowAggregator::direct(self.query.clone(), self.plan.use_local_cache);
                match table {
                    Some((table, _)) => aggregator.with_lookup(table),
                    None => aggregator,
                }
            }
        };

        let (partials, row_counters) = aggregator
            .aggregate(&buckets)
            .map_err(|e| e.in_stage(Stage::RowAggregation))?;
        drop(buckets);

        let reducer = ColumnReducer::new(
            self.query.modulus.clone(),
            self.plan.column_reduction,
            self.plan.num_column_partitions,
        );
        let reduced = reducer.reduce(partials);

        let response = Response::assemble(self.query.info.clone(), reduced)
            .map_err(|e| e.in_stage(Stage::Response))?;

        let mut counters = counters.merge(row_counters);
        counters.columns_with_data = response.columns_with_data() as u64;

        tracing::info!(
            columns = response.num_columns(),
            columns_with_data = counters.columns_with_data,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Computed response"
        );

        Ok(RunOutput {
            response,
            counters,
            table_source,
        })
    }

    fn prepare_table(&self) -> Result<Option<(Arc<ExpTable>, TableSource)>> {
        let storage: Option<&dyn Storage> = match self.plan.table {
            TablePolicy::None => return Ok(None),
            TablePolicy::InMemory => None,
            TablePolicy::Persisted => Some(&self.storage),
        };
        let (table, source) = prepare_table(&self.query, storage)?;
        Ok(Some((Arc::new(table), source)))
    }

    fn route(&self, records: &[(u64, Record)]) -> Result<(Vec<RowBucket>, Counters)> {
        let router = SelectorRouter::new(self.query.clone());
        let partition_len = records
            .len()
            .div_ceil(self.plan.num_data_partitions)
            .max(1);

        let routed: Vec<(RowPartition, Counters)> = records
            .par_chunks(partition_len)
            .map(|partition| router.route_partition(partition))
            .collect::<Result<_>>()?;

        let (partitions, counters): (Vec<RowPartition>, Vec<Counters>) = routed.into_iter().unzip();
        let counters: Counters = counters.into_iter().sum();

        let (buckets, limit_counters) = build_buckets(partitions, self.plan.hit_limit);
        Ok((buckets, counters.merge(limit_counters)))
    }
}

/// A persisted table must go where the config says, through the storage
fn check_table_dir<S: Storage>(plan: &RunPlan, storage: &S) -> Result<()> {
    if plan.table != TablePolicy::Persisted {
        return Ok(());
    }
    match (storage.exp_table_dir(), plan.table_dir.as_deref()) {
        (Some(actual), Some(expected)) if actual == expected => Ok(()),
        (None, _) => Err(Error::Config(
            "persisted exponentiation table enabled but storage has no table directory".into(),
        )),
        (Some(actual), expected) => Err(Error::Config(format!(
            "storage table directory {} does not match configured table_dir {}",
            actual.display(),
            expected.map_or_else(|| "<unset>".into(), |p| p.display().to_string())
        ))),
    }
}
