//! Run counters
//!
//! Workers never share a mutable counter. Each one accumulates a local
//! `Counters` and the pipeline merges them with [`Counters::merge`], which is
//! plain integer addition and therefore order-independent.

use std::collections::BTreeMap;

/// Counters collected over one query run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// Records handed to the router
    pub records_received: u64,
    /// Records the schema/stop-list collaborator marked as not kept
    pub records_filtered: u64,
    /// Records that passed the filter and were routed to a row
    pub records_after_filter: u64,
    /// Records dropped by the per-selector hit cap
    pub hits_dropped: u64,
    /// Retained records per selector value
    pub selector_hits: BTreeMap<String, u64>,
    /// Row buckets aggregated
    pub rows_aggregated: u64,
    /// Column partials emitted by row aggregation
    pub column_partials: u64,
    /// Columns that received at least one partial
    pub columns_with_data: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&mut self, selector: &str) {
        *self.selector_hits.entry(selector.to_string()).or_insert(0) += 1;
    }

    /// Records retained after filtering and hit limiting
    pub fn records_retained(&self) -> u64 {
        self.records_after_filter - self.hits_dropped
    }

    /// Combine two partial counter sets
    pub fn merge(mut self, other: Counters) -> Counters {
        self.records_received += other.records_received;
        self.records_filtered += other.records_filtered;
        self.records_after_filter += other.records_after_filter;
        self.hits_dropped += other.hits_dropped;
        self.rows_aggregated += other.rows_aggregated;
        self.column_partials += other.column_partials;
        self.columns_with_data += other.columns_with_data;
        for (selector, hits) in other.selector_hits {
            *self.selector_hits.entry(selector).or_insert(0) += hits;
        }
        self
    }

    /// Push the final values to the `metrics` recorder and log a summary
    pub fn publish(&self) {
        metrics::counter!("wideskies_records_received_total").increment(self.records_received);
        metrics::counter!("wideskies_records_filtered_total").increment(self.records_filtered);
        metrics::counter!("wideskies_records_after_filter_total")
            .increment(self.records_after_filter);
        metrics::counter!("wideskies_hits_dropped_total").increment(self.hits_dropped);
        metrics::counter!("wideskies_rows_aggregated_total").increment(self.rows_aggregated);
        metrics::counter!("wideskies_column_partials_total").increment(self.column_partials);
        metrics::gauge!("wideskies_selectors_hit").set(self.selector_hits.len() as f64);

        tracing::info!(
            records_received = self.records_received,
            records_filtered = self.records_filtered,
            records_after_filter = self.records_after_filter,
            hits_dropped = self.hits_dropped,
            selectors = self.selector_hits.len(),
            rows = self.rows_aggregated,
            column_partials = self.column_partials,
            columns_with_data = self.columns_with_data,
            "Run counters"
        );
        for (selector, hits) in &self.selector_hits {
            tracing::debug!(selector = %selector, hits, "Selector hits");
        }
    }
}

impl std::iter::Sum for Counters {
    fn sum<I: Iterator<Item = Counters>>(iter: I) -> Self {
        iter.fold(Counters::default(), Counters::merge)
    }
}
