use crate::metrics::METRICS_PREFIX;
use const_format::concatcp;
use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_histogram_vec, CounterVec, HistogramVec};

const MAINTENANCE_METRICS_PREFIX: &str = concatcp!(METRICS_PREFIX, "maintenances_");

lazy_static! {
    pub static ref MAINTENANCE_RECONCILE_COUNTER: CounterVec = register_counter_vec!(
        concatcp!(MAINTENANCE_METRICS_PREFIX, "reconcile_counter"),
        "Number of reconciliations by the NodeMaintenance controller.",
        &["name"]
    )
    .unwrap();
    pub static ref MAINTENANCE_ACTION_COUNTER: CounterVec = register_counter_vec!(
        concatcp!(MAINTENANCE_METRICS_PREFIX, "action_counter"),
        "Number of actions taken by the NodeMaintenance controller.",
        &["name", "action"]
    )
    .unwrap();
    pub static ref MAINTENANCE_OUTCOME_COUNTER: CounterVec = register_counter_vec!(
        concatcp!(MAINTENANCE_METRICS_PREFIX, "outcome_counter"),
        "Outcomes of NodeMaintenance reconciliations, by phase or failure kind.",
        &["name", "outcome"]
    )
    .unwrap();
    pub static ref MAINTENANCE_WRITE_HISTOGRAM: HistogramVec = register_histogram_vec!(
        concatcp!(MAINTENANCE_METRICS_PREFIX, "write_duration_seconds"),
        "Amount of time taken by the write phase of the NodeMaintenance controller.",
        &["name", "action"]
    )
    .unwrap();
    pub static ref DRAIN_DURATION_HISTOGRAM: HistogramVec = register_histogram_vec!(
        concatcp!(MAINTENANCE_METRICS_PREFIX, "drain_duration_seconds"),
        "Time spent draining a node in a single reconciliation.",
        &["node"]
    )
    .unwrap();
}
