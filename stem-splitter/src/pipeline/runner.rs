//! Drives one job from `Pending` to a terminal state.
//!
//! Stage checkpoints: 0.1 on entry, 0.3 once an engine slot is held, 0.7 while
//! packaging, then `Completed`. Any stage failure moves the job to `Failed`
//! and removes what it produced so far.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::archive::ArchiveBuilder;
use super::engine_pool::EnginePool;
use crate::jobs::{Job, JobManager, JobStatus, JobUpdate};
use crate::metrics::{MetricsCollector, OP_ARCHIVE, OP_JOB, OP_SEPARATION};
use crate::utils::fs::{cleanup_paths, file_size, owned_paths};
use crate::{Error, Result};

const PROGRESS_STARTED: f64 = 0.1;
const PROGRESS_SEPARATING: f64 = 0.3;
const PROGRESS_PACKAGING: f64 = 0.7;

/// Settings shared by every pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory archives are written to, as `<job id>.zip`.
    pub archive_dir: PathBuf,
    /// Engine call timeout; `None` waits forever.
    pub engine_timeout: Option<Duration>,
    /// Delay before a completed job's files are removed.
    pub cleanup_delay: Duration,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(PathBuf),
    /// Shutdown began before an engine slot was free; the job keeps its
    /// last persisted status.
    Interrupted,
}

/// The processing pipeline. One instance is shared by all runs.
pub struct JobPipeline {
    jobs: Arc<JobManager>,
    engines: Arc<EnginePool>,
    archiver: ArchiveBuilder,
    metrics: Arc<MetricsCollector>,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl JobPipeline {
    pub fn new(
        jobs: Arc<JobManager>,
        engines: Arc<EnginePool>,
        archiver: ArchiveBuilder,
        metrics: Arc<MetricsCollector>,
        config: PipelineConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            jobs,
            engines,
            archiver,
            metrics,
            config,
            shutdown,
        }
    }

    pub fn archive_path(&self, job_id: &str) -> PathBuf {
        self.config.archive_dir.join(format!("{job_id}.zip"))
    }

    /// Run the job to completion, then wait out its delayed cleanup.
    pub async fn run(&self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            warn!(job_id = %job_id, "Pipeline started for unknown job");
            return;
        };

        info!(job_id = %job_id, stems = %job.stem_count, "Starting separation job");
        let started = Instant::now();

        match self.process(&job).await {
            Ok(RunOutcome::Completed(archive)) => {
                info!(job_id = %job_id, archive = %archive.display(), "Separation completed");
                self.record_finished(JobStatus::Completed, started);
                self.delayed_cleanup(job_id).await;
            }
            Ok(RunOutcome::Interrupted) => {
                info!(job_id = %job_id, "Pipeline interrupted by shutdown before separation");
            }
            Err(e) => {
                self.fail(&job, &e).await;
                self.record_finished(JobStatus::Failed, started);
            }
        }
    }

    async fn process(&self, job: &Job) -> Result<RunOutcome> {
        self.jobs
            .transition(&job.id, JobUpdate::processing(PROGRESS_STARTED))
            .await?;

        let lease = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(RunOutcome::Interrupted),
            lease = self.engines.acquire(job.stem_count) => lease?,
        };

        self.jobs
            .transition(&job.id, JobUpdate::processing(PROGRESS_SEPARATING))
            .await?;

        let input = job.source_path.as_path();
        let engine_started = Instant::now();
        let separated = match self.config.engine_timeout {
            Some(limit) => tokio::time::timeout(limit, lease.separate(input))
                .await
                .map_err(|_| limit),
            None => Ok(lease.separate(input).await),
        };
        // The engine call is finished or abandoned; free the slot before
        // anything else happens.
        let partial_output = lease.output_dir_for(input);
        drop(lease);

        let output_dir = match separated {
            Ok(result) => {
                self.metrics
                    .record_operation(OP_SEPARATION, engine_started.elapsed());
                result?
            }
            Err(limit) => {
                warn!(
                    job_id = %job.id,
                    timeout_secs = limit.as_secs_f64(),
                    "Separation timed out, engine call abandoned"
                );
                if let Some(dir) = partial_output {
                    cleanup_paths(&job.id, &[dir]).await;
                }
                return Err(Error::EngineTimeout(limit));
            }
        };
        debug!(job_id = %job.id, output = %output_dir.display(), "Engine finished");

        self.jobs
            .transition(
                &job.id,
                JobUpdate::processing(PROGRESS_PACKAGING).with_output_dir(&output_dir),
            )
            .await?;

        let archive_path = self.archive_path(&job.id);
        let archiver = self.archiver;
        let (source, target) = (output_dir.clone(), archive_path.clone());
        let archive_started = Instant::now();
        let summary = tokio::task::spawn_blocking(move || archiver.build(&source, &target))
            .await
            .map_err(|e| Error::Pipeline(format!("Archive task failed: {e}")))??;
        self.metrics
            .record_operation(OP_ARCHIVE, archive_started.elapsed());
        debug!(job_id = %job.id, ?summary, "Archive built");

        if !file_size(&archive_path).await.is_some_and(|size| size > 0) {
            return Err(Error::Pipeline("Output archive was not produced".to_string()));
        }

        self.jobs
            .transition(&job.id, JobUpdate::completed(&archive_path))
            .await?;
        Ok(RunOutcome::Completed(archive_path))
    }

    fn record_finished(&self, status: JobStatus, started: Instant) {
        self.metrics.record_operation(OP_JOB, started.elapsed());
        self.metrics.record_job_finished(status.as_str());
    }

    /// Mark the job failed and remove everything it produced.
    async fn fail(&self, job: &Job, cause: &Error) {
        let message = cause.to_string();
        error!(job_id = %job.id, error = %message, "Separation failed");

        let output_dir = self.jobs.get(&job.id).and_then(|j| j.output_dir);
        if let Err(e) = self
            .jobs
            .transition(&job.id, JobUpdate::failed(message))
            .await
        {
            warn!(job_id = %job.id, error = %e, "Could not record job failure");
        }

        let archive = self.archive_path(&job.id);
        let paths = owned_paths([
            Some(job.source_path.as_path()),
            output_dir.as_deref(),
            Some(archive.as_path()),
        ]);
        cleanup_paths(&job.id, &paths).await;
    }

    /// Remove a completed job's files after the configured delay, unless the
    /// job is retired first.
    async fn delayed_cleanup(&self, job_id: &str) {
        let token = self.jobs.register_cleanup(job_id);
        debug!(
            job_id = %job_id,
            delay_secs = self.config.cleanup_delay.as_secs(),
            "Scheduled cleanup"
        );

        tokio::select! {
            _ = token.cancelled() => {
                debug!(job_id = %job_id, "Cleanup cancelled");
                return;
            }
            _ = self.shutdown.cancelled() => {
                debug!(job_id = %job_id, "Cleanup abandoned at shutdown");
                return;
            }
            _ = tokio::time::sleep(self.config.cleanup_delay) => {}
        }

        self.jobs.finish_cleanup(job_id);
        let Some(job) = self.jobs.get(job_id) else {
            debug!(job_id = %job_id, "Job already retired, nothing to clean");
            return;
        };
        let paths: Vec<PathBuf> = job.artifact_paths().into_iter().map(Path::to_path_buf).collect();
        cleanup_paths(job_id, &paths).await;
        info!(job_id = %job_id, "Cleaned up temporary files");
    }
}
