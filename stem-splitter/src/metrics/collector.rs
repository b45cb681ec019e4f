//! Metrics collector implementation.
//!
//! Collects per-operation timings and job outcome counts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Operation timed around storing an upload.
pub const OP_UPLOAD: &str = "upload";
/// Operation timed around the engine call.
pub const OP_SEPARATION: &str = "separation";
/// Operation timed around building the result archive.
pub const OP_ARCHIVE: &str = "archive";
/// Operation timed from pipeline start to a terminal state.
pub const OP_JOB: &str = "job";

/// Operations slower than this are logged as warnings by default.
pub const DEFAULT_SLOW_OPERATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct OperationTimings {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

impl OperationTimings {
    fn first(elapsed: Duration) -> Self {
        Self {
            count: 1,
            total: elapsed,
            min: elapsed,
            max: elapsed,
        }
    }

    fn add(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = self.min.min(elapsed);
        self.max = self.max.max(elapsed);
    }
}

/// Metrics collector for the separation service.
#[derive(Debug)]
pub struct MetricsCollector {
    operations: DashMap<String, OperationTimings>,
    jobs_total: DashMap<String, AtomicU64>,
    slow_threshold: Duration,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::with_slow_threshold(DEFAULT_SLOW_OPERATION)
    }

    pub fn with_slow_threshold(slow_threshold: Duration) -> Self {
        Self {
            operations: DashMap::new(),
            jobs_total: DashMap::new(),
            slow_threshold,
        }
    }

    /// Record how long one run of `operation` took.
    pub fn record_operation(&self, operation: &str, elapsed: Duration) {
        self.operations
            .entry(operation.to_string())
            .and_modify(|timings| timings.add(elapsed))
            .or_insert_with(|| OperationTimings::first(elapsed));

        if elapsed > self.slow_threshold {
            warn!(
                operation,
                elapsed_secs = elapsed.as_secs_f64(),
                "Slow operation detected"
            );
        }
    }

    /// Record a job reaching `status`.
    pub fn record_job_finished(&self, status: impl Into<String>) {
        self.jobs_total
            .entry(status.into())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        self.operations.clear();
        self.jobs_total.clear();
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations: self
                .operations
                .iter()
                .map(|e| {
                    let t = *e.value();
                    let stats = OperationStats {
                        count: t.count,
                        avg_secs: t.total.as_secs_f64() / t.count as f64,
                        min_secs: t.min.as_secs_f64(),
                        max_secs: t.max.as_secs_f64(),
                        total_secs: t.total.as_secs_f64(),
                    };
                    (e.key().clone(), stats)
                })
                .collect(),
            jobs_total: self
                .jobs_total
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated timings of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub count: u64,
    pub avg_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub total_secs: f64,
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub operations: BTreeMap<String, OperationStats>,
    /// Finished jobs by terminal status.
    pub jobs_total: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn operation(&self, name: &str) -> Option<&OperationStats> {
        self.operations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_aggregates() {
        let collector = MetricsCollector::new();
        collector.record_operation(OP_ARCHIVE, Duration::from_millis(100));
        collector.record_operation(OP_ARCHIVE, Duration::from_millis(300));
        collector.record_operation(OP_UPLOAD, Duration::from_millis(50));

        let snapshot = collector.snapshot();
        let archive = snapshot.operation(OP_ARCHIVE).unwrap();
        assert_eq!(archive.count, 2);
        assert!((archive.avg_secs - 0.2).abs() < 1e-9);
        assert!((archive.min_secs - 0.1).abs() < 1e-9);
        assert!((archive.max_secs - 0.3).abs() < 1e-9);
        assert!((archive.total_secs - 0.4).abs() < 1e-9);
        assert_eq!(snapshot.operation(OP_UPLOAD).unwrap().count, 1);
        assert!(snapshot.operation(OP_SEPARATION).is_none());
    }

    #[test]
    fn test_job_outcomes_and_reset() {
        let collector = MetricsCollector::new();
        collector.record_job_finished("completed");
        collector.record_job_finished("completed");
        collector.record_job_finished("failed");

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.jobs_total.get("completed"), Some(&2));
        assert_eq!(snapshot.jobs_total.get("failed"), Some(&1));

        collector.reset();
        assert_eq!(collector.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes_by_operation_name() {
        let collector = MetricsCollector::with_slow_threshold(Duration::ZERO);
        collector.record_operation(OP_JOB, Duration::from_secs(2));

        let json = serde_json::to_value(collector.snapshot()).unwrap();
        assert_eq!(json["operations"]["job"]["count"], 1);
        assert_eq!(json["operations"]["job"]["max_secs"], 2.0);
    }
}
