//! Job manager: lifecycle API over the job repository.
//!
//! The in-memory table is authoritative for reads. Every successful change is
//! mirrored to the repository, which is only read back by [`JobManager::load`]
//! at startup.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{Job, JobStatus, JobUpdate, StemCount};
use crate::store::JobRepository;
use crate::utils::fs::cleanup_paths;
use crate::{Error, Result};

/// Job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Jobs that have not reached a terminal state.
    pub fn active(&self) -> usize {
        self.pending + self.processing
    }
}

/// Owns the job table and the repository it is mirrored to.
pub struct JobManager {
    jobs: DashMap<String, Job>,
    repository: Arc<dyn JobRepository>,
    /// Delayed cleanup tokens by job id.
    cleanup_tokens: DashMap<String, CancellationToken>,
}

impl JobManager {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs: DashMap::new(),
            repository,
            cleanup_tokens: DashMap::new(),
        }
    }

    /// Repopulate memory from the repository.
    ///
    /// Jobs a previous process left pending or processing are loaded as-is;
    /// nothing resumes them.
    pub async fn load(&self) -> Result<usize> {
        let jobs = self.repository.list_jobs().await?;
        let mut stuck = 0;

        for job in jobs {
            if !job.is_terminal() {
                stuck += 1;
                warn!(
                    job_id = %job.id,
                    status = %job.status,
                    progress = job.progress,
                    "Job was interrupted by a restart and will not resume"
                );
            }
            self.jobs.insert(job.id.clone(), job);
        }

        let loaded = self.jobs.len();
        info!(loaded, stuck, "Loaded jobs from store");
        Ok(loaded)
    }

    /// Create a new pending job and persist it.
    pub async fn create(&self, source_path: impl Into<PathBuf>, stem_count: StemCount) -> Job {
        let job = Job::new(source_path, stem_count);
        self.jobs.insert(job.id.clone(), job.clone());
        self.persist(&job).await;
        info!(job_id = %job.id, stems = %stem_count, "Created job");
        job
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Apply a partial update and persist the new snapshot.
    ///
    /// Unknown ids and rejected transitions leave the table untouched.
    pub async fn transition(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let next = {
            let mut entry = self
                .jobs
                .get_mut(id)
                .ok_or_else(|| Error::not_found("Job", id))?;
            let next = entry.value().transitioned(&update, Utc::now())?;
            *entry.value_mut() = next.clone();
            next
        };

        debug!(
            job_id = %id,
            status = %next.status,
            progress = next.progress,
            "Job transitioned"
        );
        self.persist(&next).await;
        Ok(next)
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Ids of terminal jobs that completed before `cutoff`.
    pub fn completed_before(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|e| e.value().completed_before(cutoff))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for entry in self.jobs.iter() {
            match entry.value().status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Remove a job and delete everything it owns on disk.
    pub async fn retire(&self, id: &str) -> Option<Job> {
        let (_, job) = self.jobs.remove(id)?;

        if let Some((_, token)) = self.cleanup_tokens.remove(id) {
            token.cancel();
        }
        if let Err(e) = self.repository.delete_job(id).await {
            warn!(job_id = %id, error = %e, "Failed to delete job record");
        }
        cleanup_paths(id, &job.artifact_paths()).await;

        info!(job_id = %id, status = %job.status, "Retired job");
        Some(job)
    }

    /// Register the delayed cleanup of a job, returning its cancellation token.
    pub fn register_cleanup(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.cleanup_tokens.insert(id.to_string(), token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Forget a finished delayed cleanup.
    pub fn finish_cleanup(&self, id: &str) {
        self.cleanup_tokens.remove(id);
    }

    /// Number of delayed cleanups still scheduled.
    pub fn pending_cleanups(&self) -> usize {
        self.cleanup_tokens.len()
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.repository.save_job(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist job; continuing in memory");
        }
    }
}
