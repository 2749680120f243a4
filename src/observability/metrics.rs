//! Pipeline metrics, recorded through the `metrics` facade.
//!
//! Nothing is exported by this crate; whichever recorder the host installs
//! receives the values. Without one every call is a no-op.

use std::fmt;

use crate::domain::Entity;

/// Every metric the pipeline records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Per-entity stage throughput
    RecordsRead,
    RecordsNormalized,
    RecordsRejected,
    DuplicatesMerged,
    OrphanReferences,
    RowsLoaded,

    // Whole run
    RunsCompleted,
    RunsFailed,
    RunDuration,
    StoreTables,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::RecordsRead => "keylime_records_read_total",
            MetricName::RecordsNormalized => "keylime_records_normalized_total",
            MetricName::RecordsRejected => "keylime_records_rejected_total",
            MetricName::DuplicatesMerged => "keylime_duplicates_merged_total",
            MetricName::OrphanReferences => "keylime_orphan_references_total",
            MetricName::RowsLoaded => "keylime_rows_loaded_total",
            MetricName::RunsCompleted => "keylime_runs_completed_total",
            MetricName::RunsFailed => "keylime_runs_failed_total",
            MetricName::RunDuration => "keylime_run_duration_seconds",
            MetricName::StoreTables => "keylime_store_tables",
        }
    }

    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        [
            MetricName::RecordsRead,
            MetricName::RecordsNormalized,
            MetricName::RecordsRejected,
            MetricName::DuplicatesMerged,
            MetricName::OrphanReferences,
            MetricName::RowsLoaded,
            MetricName::RunsCompleted,
            MetricName::RunsFailed,
            MetricName::RunDuration,
            MetricName::StoreTables,
        ]
        .into_iter()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Add `value` to a per-entity counter.
pub fn emit_counter(name: MetricName, entity: Entity, value: u64) {
    ::metrics::counter!(name.as_str(), "entity" => entity.as_str()).increment(value);
}

/// Set a run-level gauge.
pub fn emit_gauge(name: MetricName, value: f64) {
    ::metrics::gauge!(name.as_str()).set(value);
}

/// Rows written to one warehouse table.
pub fn rows_loaded(table: &str, rows: u64) {
    ::metrics::counter!(MetricName::RowsLoaded.as_str(), "table" => table.to_string()).increment(rows);
}

pub fn run_completed(duration_secs: f64, tables: usize) {
    ::metrics::counter!(MetricName::RunsCompleted.as_str()).increment(1);
    ::metrics::histogram!(MetricName::RunDuration.as_str()).record(duration_secs);
    emit_gauge(MetricName::StoreTables, tables as f64);
}

pub fn run_failed(code: &'static str) {
    ::metrics::counter!(MetricName::RunsFailed.as_str(), "code" => code).increment(1);
}
