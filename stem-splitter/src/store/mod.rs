//! Durable job records.
//!
//! The job manager keeps the authoritative copy of every job in memory and
//! mirrors each snapshot through a [`JobRepository`].

mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

pub use file::FileJobRepository;
pub use memory::MemoryJobRepository;

use crate::config::{AppConfig, StoreBackend};
use crate::jobs::Job;
use crate::Result;

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or replace the whole record for `job.id`.
    async fn save_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
    /// Every readable record. Unreadable records are skipped.
    async fn list_jobs(&self) -> Result<Vec<Job>>;
    /// Remove a record. Removing a missing record is not an error.
    async fn delete_job(&self, id: &str) -> Result<()>;
}

/// Build the repository selected by `config.store_backend`.
pub async fn open_repository(config: &AppConfig) -> Result<Arc<dyn JobRepository>> {
    Ok(match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryJobRepository::new()),
        StoreBackend::File => Arc::new(FileJobRepository::open(&config.jobs_dir).await?),
    })
}
