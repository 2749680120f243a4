// Observability: metrics recording

pub mod metrics;

pub use metrics::{emit_counter, emit_gauge, MetricName};
