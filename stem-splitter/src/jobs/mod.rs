//! Job model and the in-memory job table.

mod manager;
mod model;

pub use manager::{JobManager, JobStats};
pub use model::{Job, JobStatus, JobStatusView, JobUpdate, StemCount};
