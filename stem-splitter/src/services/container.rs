//! Service container.
//!
//! Built once at process start. Owns the configuration, job manager, engine
//! pool, pipeline supervisor and retention sweeper, and exposes the
//! submission, status and result surfaces used by the transport layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::jobs::{Job, JobManager, JobStats, JobStatus, JobStatusView, JobUpdate, StemCount};
use crate::metrics::{MetricsCollector, MetricsSnapshot, OP_UPLOAD};
use crate::pipeline::{
    ArchiveBuilder, CommandEngineFactory, EngineFactory, EnginePool, JobPipeline,
    JobPurgeService, PipelineConfig, PipelineSupervisor, PurgeConfig,
};
use crate::store::open_repository;
use crate::upload::{UploadConfig, UploadGuard};
use crate::utils::disk::DiskMonitor;
use crate::utils::fs::{cleanup_paths, ensure_dir_all, file_size, io_error};
use crate::{Error, Result};

/// A completed job's archive, opened for streaming.
#[derive(Debug)]
pub struct ResultArchive {
    pub file: tokio::fs::File,
    pub path: PathBuf,
    /// Size taken from the opened handle.
    pub size_bytes: u64,
    pub download_name: String,
}

/// What the result surface returns for a job.
#[derive(Debug)]
pub enum JobResultView {
    /// The archive is ready for download.
    Ready(ResultArchive),
    /// The job has not completed.
    NotReady {
        status: JobStatus,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Service health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
    pub upload_accessible: bool,
    pub output_accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_space_gb: Option<f64>,
    pub disk_ok: bool,
    pub jobs: JobStats,
    pub engine_slots_available: usize,
    pub engine_slots_total: usize,
}

/// Service container holding all application services.
pub struct ServiceContainer {
    config: AppConfig,
    jobs: Arc<JobManager>,
    engines: Arc<EnginePool>,
    pipeline: Arc<JobPipeline>,
    supervisor: PipelineSupervisor,
    uploads: UploadGuard,
    metrics: Arc<MetricsCollector>,
    purge: JobPurgeService,
    cancellation_token: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Build the container with the command-line engine.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let factory = Arc::new(CommandEngineFactory::new(
            config.engine_program.clone(),
            config.output_dir.clone(),
        ));
        Self::with_engine_factory(config, factory).await
    }

    /// Build the container around a custom engine factory.
    pub async fn with_engine_factory(
        config: AppConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        config.validate()?;
        ensure_dir_all(&config.upload_dir).await?;
        ensure_dir_all(&config.output_dir).await?;

        let repository = open_repository(&config).await?;
        let jobs = Arc::new(JobManager::new(repository));
        jobs.load().await?;

        let cancellation_token = CancellationToken::new();
        let engines = Arc::new(EnginePool::new(factory, config.max_concurrent_separations));
        let metrics = Arc::new(MetricsCollector::with_slow_threshold(config.slow_operation()));
        let pipeline = Arc::new(JobPipeline::new(
            jobs.clone(),
            engines.clone(),
            ArchiveBuilder::new(),
            metrics.clone(),
            PipelineConfig {
                archive_dir: config.output_dir.clone(),
                engine_timeout: config.engine_timeout(),
                cleanup_delay: config.cleanup_delay(),
            },
            cancellation_token.clone(),
        ));
        let purge = JobPurgeService::new(
            PurgeConfig::new()
                .with_retention_secs(config.retention_secs)
                .with_check_interval_secs(config.sweep_interval_secs),
            jobs.clone(),
        );

        info!(
            store = ?config.store_backend,
            max_concurrent = engines.max_concurrent(),
            upload_dir = %config.upload_dir.display(),
            output_dir = %config.output_dir.display(),
            "Service container initialized"
        );

        Ok(Self {
            uploads: UploadGuard::new(UploadConfig::from(&config)),
            metrics,
            config,
            jobs,
            engines,
            pipeline,
            supervisor: PipelineSupervisor::new(),
            purge,
            cancellation_token,
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start the retention sweeper and pre-warm engines in the background.
    pub fn start(&self) {
        let mut background = self.background.lock();
        background.push(
            self.purge
                .start_background_task(self.cancellation_token.child_token()),
        );

        if !self.config.prewarm_stems.is_empty() {
            let engines = self.engines.clone();
            let variants = self.config.prewarm_stems.clone();
            let token = self.cancellation_token.child_token();
            background.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => debug!("Engine pre-warming cancelled"),
                    _ = engines.prewarm(&variants) => {}
                }
            }));
        }
    }

    /// Validate and store an upload, create its job and dispatch the pipeline.
    pub async fn submit<R>(
        &self,
        filename: &str,
        declared_size: Option<u64>,
        reader: &mut R,
        stem_count: StemCount,
    ) -> Result<Job>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Pipeline("Service is shutting down".to_string()));
        }

        let upload_started = Instant::now();
        let stored = self.uploads.store(filename, declared_size, reader).await?;
        self.metrics
            .record_operation(OP_UPLOAD, upload_started.elapsed());
        let job = self.jobs.create(&stored.path, stem_count).await;

        let pipeline = self.pipeline.clone();
        let job_id = job.id.clone();
        if let Err(e) = self
            .supervisor
            .spawn(&job.id, async move { pipeline.run(&job_id).await })
        {
            warn!(job_id = %job.id, error = %e, "Could not dispatch job");
            let _ = self
                .jobs
                .transition(&job.id, JobUpdate::failed(e.to_string()))
                .await;
            cleanup_paths(&job.id, &[&stored.path]).await;
            return Err(e);
        }

        info!(
            job_id = %job.id,
            file = %filename,
            bytes = stored.size_bytes,
            stems = %stem_count,
            "Job submitted"
        );
        Ok(job)
    }

    /// Public status of a job.
    pub async fn status(&self, id: &str) -> Option<JobStatusView> {
        let job = self.jobs.get(id)?;
        let size = match &job.result_path {
            Some(path) if job.status == JobStatus::Completed => file_size(path).await,
            _ => None,
        };
        Some(JobStatusView::from_job(&job, size, Utc::now()))
    }

    /// Result of a job: the opened archive when completed, its status
    /// otherwise.
    pub async fn result(&self, id: &str) -> Result<JobResultView> {
        let job = self.jobs.get(id).ok_or_else(|| Error::not_found("Job", id))?;

        if job.status != JobStatus::Completed {
            return Ok(JobResultView::NotReady {
                status: job.status,
                error: job.error,
            });
        }

        let path = job
            .result_path
            .clone()
            .ok_or_else(|| Error::ResultMissing(id.to_string()))?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ResultMissing(id.to_string()));
            }
            Err(e) => return Err(io_error("opening", &path, e)),
        };
        let metadata = file
            .metadata()
            .await
            .map_err(|e| io_error("reading metadata of", &path, e))?;
        if !metadata.is_file() {
            return Err(Error::ResultMissing(id.to_string()));
        }

        Ok(JobResultView::Ready(ResultArchive {
            file,
            path,
            size_bytes: metadata.len(),
            download_name: download_name(&job),
        }))
    }

    /// Operation timings and job outcome counts since startup.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Directory writability, free space and job counts.
    pub async fn health(&self) -> HealthReport {
        let upload_accessible = is_writable(&self.config.upload_dir).await;
        let output_accessible = is_writable(&self.config.output_dir).await;

        let disk = DiskMonitor::new().check(&self.config.upload_dir, self.config.min_free_space_bytes);
        let disk_ok = !disk.is_insufficient();
        let disk_space_gb = disk
            .available_bytes()
            .map(|bytes| (bytes as f64 / (1024.0 * 1024.0 * 1024.0) * 100.0).round() / 100.0);

        let status = if upload_accessible && output_accessible && disk_ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            max_file_size_mb: self.config.max_file_size_bytes / (1024 * 1024),
            allowed_extensions: self.config.allowed_extensions.iter().cloned().collect(),
            upload_accessible,
            output_accessible,
            disk_space_gb,
            disk_ok,
            jobs: self.jobs.stats(),
            engine_slots_available: self.engines.available(),
            engine_slots_total: self.engines.max_concurrent(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn engines(&self) -> &Arc<EnginePool> {
        &self.engines
    }

    pub fn supervisor(&self) -> &PipelineSupervisor {
        &self.supervisor
    }

    pub fn purge_service(&self) -> &JobPurgeService {
        &self.purge
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop background tasks and wait for running pipelines.
    pub async fn shutdown(&self) {
        let timeout = self.config.shutdown_timeout();
        info!(timeout_secs = timeout.as_secs(), "Shutting down services");

        self.cancellation_token.cancel();
        self.engines.close();

        let background: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let aborted = self.supervisor.shutdown(timeout).await;
        if aborted > 0 {
            warn!(aborted, "Aborted pipeline tasks at shutdown");
        }

        let stats = self.jobs.stats();
        if stats.active() > 0 {
            warn!(
                pending = stats.pending,
                processing = stats.processing,
                "Jobs left unfinished at shutdown will not resume"
            );
        }
        info!("Services shut down");
    }
}

/// Download name for a job's archive: `separated_{N}stems_{id prefix}.zip`.
fn download_name(job: &Job) -> String {
    let prefix: String = job.id.chars().take(8).collect();
    format!("separated_{}stems_{prefix}.zip", job.stem_count)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

async fn is_writable(dir: &Path) -> bool {
    let marker = dir.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
    match tokio::fs::write(&marker, b"").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&marker).await;
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_name_is_sanitised() {
        let mut job = Job::new("/uploads/a.mp3", StemCount::Four);
        job.id = "1a2b3c4d-5e6f-7a8b-9c0d-112233445566".to_string();
        assert_eq!(download_name(&job), "separated_4stems_1a2b3c4d.zip");

        job.id = "ab\"/..\\x".to_string();
        assert_eq!(download_name(&job), "separated_4stems_ab..x.zip");
    }

    #[tokio::test]
    async fn test_is_writable() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(is_writable(temp.path()).await);
        assert!(!is_writable(&temp.path().join("missing")).await);
    }
}
