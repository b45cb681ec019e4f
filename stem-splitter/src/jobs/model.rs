//! Job data model and the lifecycle rules applied on every transition.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of stems the engine separates a track into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StemCount {
    /// Vocals and accompaniment.
    Two,
    /// Vocals, drums, bass and other.
    Four,
    /// Vocals, drums, bass, piano and other.
    Five,
}

impl StemCount {
    pub const ALL: [StemCount; 3] = [StemCount::Two, StemCount::Four, StemCount::Five];

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Two => 2,
            Self::Four => 4,
            Self::Five => 5,
        }
    }

    /// Engine model identifier for this variant.
    pub fn model_name(self) -> String {
        format!("spleeter:{}stems", self.as_u8())
    }
}

impl fmt::Display for StemCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl TryFrom<i64> for StemCount {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            5 => Ok(Self::Five),
            other => Err(Error::validation(format!(
                "Invalid stems value: {other}. Must be 2, 4, or 5."
            ))),
        }
    }
}

impl TryFrom<u8> for StemCount {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::try_from(i64::from(value))
    }
}

impl From<StemCount> for u8 {
    fn from(value: StemCount) -> Self {
        value.as_u8()
    }
}

impl FromStr for StemCount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: i64 = s.trim().parse().map_err(|_| {
            Error::validation(format!(
                "Invalid stems value: {s}. Must be an integer (2, 4, or 5)."
            ))
        })?;
        Self::try_from(value)
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is waiting to be processed.
    Pending,
    /// Job is currently being processed.
    Processing,
    /// Job completed successfully.
    Completed,
    /// Job failed.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A separation job.
///
/// This is also the persisted record: optional fields are omitted from the
/// serialized form until they are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Validated input file.
    pub source_path: PathBuf,
    /// Requested number of stems.
    pub stem_count: StemCount,
    /// Current status.
    pub status: JobStatus,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job first entered `Processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Stage progress in `[0.0, 1.0]`.
    pub progress: f64,
    /// Failure description, only when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Produced archive, only when completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    /// Engine output directory once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(source_path: impl Into<PathBuf>, stem_count: StemCount) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: source_path.into(),
            stem_count,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            error: None,
            result_path: None,
            output_dir: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job completed before `cutoff`.
    pub fn completed_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_terminal() && self.completed_at.is_some_and(|at| at < cutoff)
    }

    /// Every file or directory this job may own on disk.
    pub fn artifact_paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.source_path.as_path()];
        paths.extend(self.output_dir.as_deref());
        paths.extend(self.result_path.as_deref());
        paths
    }

    /// Build the snapshot that results from applying `update` at `now`.
    ///
    /// `self` is left untouched; callers swap the returned record in whole.
    pub fn transitioned(&self, update: &JobUpdate, now: DateTime<Utc>) -> Result<Job> {
        let target = update.status.unwrap_or(self.status);

        if self.is_terminal() || (target == JobStatus::Pending && self.status != JobStatus::Pending)
        {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        let mut next = self.clone();
        next.status = target;

        if let Some(progress) = update.progress
            && !progress.is_nan()
        {
            next.progress = next.progress.max(progress.clamp(0.0, 1.0));
        }

        if let Some(dir) = &update.output_dir {
            next.output_dir = Some(dir.clone());
        }

        if target == JobStatus::Processing && next.started_at.is_none() {
            next.started_at = Some(now);
        }

        match target {
            JobStatus::Completed => {
                let result_path = update.result_path.clone().ok_or_else(|| {
                    Error::validation(format!("Job {} cannot complete without a result", self.id))
                })?;
                next.result_path = Some(result_path);
                next.error = None;
            }
            JobStatus::Failed => {
                let error = update
                    .error
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| {
                        Error::validation(format!("Job {} cannot fail without an error", self.id))
                    })?;
                next.error = Some(error.to_string());
                next.result_path = None;
            }
            JobStatus::Pending | JobStatus::Processing => {}
        }

        if target.is_terminal() {
            next.completed_at = Some(now);
            next.progress = 1.0;
        }

        Ok(next)
    }
}

/// Partial update applied by [`Job::transitioned`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub error: Option<String>,
    pub result_path: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl JobUpdate {
    /// Enter (or stay in) `Processing` at the given stage checkpoint.
    pub fn processing(progress: f64) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn completed(result_path: impl Into<PathBuf>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result_path: Some(result_path.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Public status of a job as exposed to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub stems: StemCount,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time_secs: Option<f64>,
}

impl JobStatusView {
    /// Build the view. `result_size_bytes` is the on-disk size of the archive
    /// if it still exists.
    pub fn from_job(job: &Job, result_size_bytes: Option<u64>, now: DateTime<Utc>) -> Self {
        let completed = job.status == JobStatus::Completed && job.result_path.is_some();
        let secs = |from: DateTime<Utc>, to: DateTime<Utc>| {
            ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
        };

        Self {
            job_id: job.id.clone(),
            status: job.status,
            stems: job.stem_count,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            progress: job.progress,
            error: job.error.clone(),
            result_url: completed.then(|| format!("/jobs/{}/result", job.id)),
            result_size_bytes: if completed { result_size_bytes } else { None },
            processing_time_secs: match (job.started_at, job.completed_at) {
                (Some(start), Some(end)) => Some(secs(start, end)),
                _ => None,
            },
            elapsed_time_secs: match (job.started_at, job.completed_at) {
                (Some(start), None) => Some(secs(start, now)),
                _ => None,
            },
        }
    }
}
