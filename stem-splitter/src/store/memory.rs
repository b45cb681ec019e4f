//! In-process job repository.

use async_trait::async_trait;
use dashmap::DashMap;

use super::JobRepository;
use crate::Result;
use crate::jobs::Job;

/// Job repository backed by a concurrent map. Records do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryJobRepository {
    jobs: DashMap<String, Job>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.jobs.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs.remove(id);
        Ok(())
    }
}
