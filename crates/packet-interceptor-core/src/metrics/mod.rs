//! Metrics collection for the packet interception pipeline.
//!
//! Provides Prometheus-compatible metrics for monitoring dispatch volume,
//! drops, and listener latency.

pub mod prometheus;

pub use self::prometheus::{DropReason, PipelineMetrics};
