//! Trellis Feed Telemetry
//!
//! Structured logging and Prometheus metrics for the feed process. Metrics
//! are registered on an explicit registry owned by `main`.

pub mod metrics;
pub mod tracer;

pub use metrics::{render_metrics, FeedMetrics};
pub use tracer::{init_tracing, TelemetryConfig};
