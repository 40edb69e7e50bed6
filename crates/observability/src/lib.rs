//! Tracing, logging, metrics (shared setup).

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Metric names and exporter setup.
pub mod metrics;

pub use self::tracing::LogFormat;

/// Initialize process-wide observability with the given log format.
pub fn init_with(format: LogFormat) {
    tracing::init(format);
    metrics::describe();
}
