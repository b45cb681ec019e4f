//! Service wiring.

mod container;

pub use container::{HealthReport, HealthStatus, JobResultView, ResultArchive, ServiceContainer};
