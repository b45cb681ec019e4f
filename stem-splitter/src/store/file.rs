//! Job repository that keeps one JSON document per job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::JobRepository;
use crate::jobs::Job;
use crate::utils::fs::{ensure_dir_all, io_error};
use crate::{Error, Result};

const RECORD_EXTENSION: &str = "json";

/// File-backed job repository.
///
/// Each record is written to a temporary file and renamed over `<id>.json`,
/// so readers never observe a partially written record.
#[derive(Debug, Clone)]
pub struct FileJobRepository {
    dir: PathBuf,
}

impl FileJobRepository {
    /// Open the repository, creating `dir` if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::validation(format!("Invalid job id: {id}")));
        }
        Ok(self.dir.join(format!("{id}.{RECORD_EXTENSION}")))
    }

    async fn read_record(path: &Path) -> Result<Job> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| io_error("reading job record", path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl JobRepository for FileJobRepository {
    async fn save_job(&self, job: &Job) -> Result<()> {
        let path = self.record_path(&job.id)?;
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp"));
        let bytes = serde_json::to_vec_pretty(job)?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("writing job record", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("replacing job record", &path, e));
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let path = self.record_path(id)?;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Self::read_record(&path).await.map(Some),
            Ok(false) => Ok(None),
            Err(e) => Err(io_error("checking job record", &path, e)),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error("listing job records", &self.dir, e))?;

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing job records", &self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job record");
                }
            }
        }

        debug!(count = jobs.len(), dir = %self.dir.display(), "Listed job records");
        Ok(jobs)
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let path = self.record_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("removing job record", &path, e)),
        }
    }
}
