//! Rotation statistics and health inputs.
//!
//! Counters are plain atomics so recording never blocks a refresh or a query path.

mod metrics;

pub use metrics::{Counter, FailureRecord, Gauge, RotationStats, StatsSnapshot};
