//! Observability for conductor services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus and JSON export
//! - **Spans**: trace-id carrying spans for plans, stages and dispatches

pub mod logging;
pub mod metrics;
pub mod spans;
