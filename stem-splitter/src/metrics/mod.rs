//! Metrics and monitoring module.
//!
//! Tracks how long uploads, separations, archive builds and whole jobs take,
//! and how many jobs ended in each terminal status. Operations slower than
//! the configured threshold are logged as warnings.

mod collector;

pub use collector::{
    DEFAULT_SLOW_OPERATION, MetricsCollector, MetricsSnapshot, OP_ARCHIVE, OP_JOB, OP_SEPARATION,
    OP_UPLOAD, OperationStats,
};
