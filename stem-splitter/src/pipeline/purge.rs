//! Retention sweeper for old completed/failed jobs.
//!
//! Runs in the background and periodically retires terminal jobs whose
//! completion time is older than the retention window.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::jobs::JobManager;

/// Configuration for the retention sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Seconds a terminal job is kept after completion.
    /// Set to 0 to keep all jobs.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl PurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }
}

/// Retires aged terminal jobs and their artifacts.
#[derive(Clone)]
pub struct JobPurgeService {
    config: PurgeConfig,
    jobs: Arc<JobManager>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, jobs: Arc<JobManager>) -> Self {
        Self { config, jobs }
    }

    /// Run a single sweep. Returns the number of retired jobs.
    pub async fn run_purge(&self) -> usize {
        if self.config.retention_secs == 0 {
            debug!("Job purging disabled (retention_secs = 0)");
            return 0;
        }

        let retention = chrono::Duration::seconds(
            i64::try_from(self.config.retention_secs).unwrap_or(i64::MAX),
        );
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return 0;
        };

        let mut retired = 0;
        for id in self.jobs.completed_before(cutoff) {
            if self.jobs.retire(&id).await.is_some() {
                retired += 1;
            }
        }

        if retired > 0 {
            info!(
                retired,
                retention_secs = self.config.retention_secs,
                "Purged old jobs"
            );
        } else {
            debug!("No jobs to purge");
        }
        retired
    }

    /// Start the background sweep loop; it stops when `cancellation_token` fires.
    pub fn start_background_task(&self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();

        tokio::spawn(async move {
            let period = Duration::from_secs(service.config.check_interval_secs.max(1));
            let mut check_interval = interval(period);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                retention_secs = service.config.retention_secs,
                interval_secs = period.as_secs(),
                "Job purge service started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        let retired = service.run_purge().await;
                        if retired > 0 {
                            debug!(retired, "Purge cycle completed");
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobUpdate, StemCount};
    use crate::store::MemoryJobRepository;

    #[test]
    fn test_purge_config_default() {
        let config = PurgeConfig::default();
        assert_eq!(config.retention_secs, 3600);
        assert_eq!(config.check_interval_secs, 3600);
    }

    #[test]
    fn test_purge_config_builder() {
        let config = PurgeConfig::new()
            .with_retention_secs(60)
            .with_check_interval_secs(5);
        assert_eq!(config.retention_secs, 60);
        assert_eq!(config.check_interval_secs, 5);
    }

    async fn seeded_manager() -> (Arc<JobManager>, Vec<String>) {
        let jobs = Arc::new(JobManager::new(Arc::new(MemoryJobRepository::new())));
        let completed = jobs.create("/uploads/a.mp3", StemCount::Two).await;
        let failed = jobs.create("/uploads/b.mp3", StemCount::Two).await;
        let running = jobs.create("/uploads/c.mp3", StemCount::Two).await;
        let pending = jobs.create("/uploads/d.mp3", StemCount::Two).await;

        jobs.transition(&completed.id, JobUpdate::completed("/out/a.zip"))
            .await
            .unwrap();
        jobs.transition(&failed.id, JobUpdate::failed("bad input"))
            .await
            .unwrap();
        jobs.transition(&running.id, JobUpdate::processing(0.3))
            .await
            .unwrap();

        let ids = vec![completed.id, failed.id, running.id, pending.id];
        (jobs, ids)
    }

    #[tokio::test]
    async fn test_fresh_terminal_jobs_are_kept() {
        let (jobs, _) = seeded_manager().await;
        let service = JobPurgeService::new(PurgeConfig::new().with_retention_secs(3600), jobs.clone());

        assert_eq!(service.run_purge().await, 0);
        assert_eq!(jobs.list().len(), 4);
    }

    #[tokio::test]
    async fn test_aged_terminal_jobs_are_retired() {
        let (jobs, ids) = seeded_manager().await;
        let service = JobPurgeService::new(PurgeConfig::new().with_retention_secs(1), jobs.clone());
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(service.run_purge().await, 2);
        assert!(jobs.get(&ids[0]).is_none());
        assert!(jobs.get(&ids[1]).is_none());
        assert!(jobs.get(&ids[2]).is_some());
        assert!(jobs.get(&ids[3]).is_some());

        // Idempotent.
        assert_eq!(service.run_purge().await, 0);
    }

    #[tokio::test]
    async fn test_zero_retention_disables_purge() {
        let (jobs, _) = seeded_manager().await;
        let service = JobPurgeService::new(PurgeConfig::new().with_retention_secs(0), jobs.clone());
        assert_eq!(service.run_purge().await, 0);
        assert_eq!(jobs.list().len(), 4);
    }

    #[tokio::test]
    async fn test_background_task_stops_on_cancel() {
        let jobs = Arc::new(JobManager::new(Arc::new(MemoryJobRepository::new())));
        let service = JobPurgeService::new(PurgeConfig::new().with_check_interval_secs(1), jobs);
        let token = CancellationToken::new();

        let handle = service.start_background_task(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
