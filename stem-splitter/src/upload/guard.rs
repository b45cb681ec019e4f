//! Validates an inbound file and persists it under the upload directory.
//!
//! Checks run cheapest first: name and extension, declared size, free disk
//! space, then the streamed byte count and a final look at the stored file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::jobs::StemCount;
use crate::utils::disk::{DiskMonitor, DiskSpaceStatus};

const CHUNK_SIZE: usize = 64 * 1024;
const MAX_FILENAME_LEN: usize = 255;
const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// Category of an upload rejection, mapped to a standard status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    BadInput,
    TooLarge,
    InsufficientStorage,
    StorageFailure,
}

impl RejectionKind {
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadInput => 400,
            Self::TooLarge => 413,
            Self::InsufficientStorage => 507,
            Self::StorageFailure => 500,
        }
    }
}

/// A rejected upload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct UploadError {
    pub kind: RejectionKind,
    pub message: String,
}

impl UploadError {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::BadInput,
            message: message.into(),
        }
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::TooLarge,
            message: message.into(),
        }
    }

    pub fn insufficient_storage(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::InsufficientStorage,
            message: message.into(),
        }
    }

    pub fn storage_failure(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::StorageFailure,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }
}

/// Upload limits.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    pub allowed_extensions: BTreeSet<String>,
    pub max_file_size_bytes: u64,
    pub min_free_space_bytes: u64,
}

impl From<&AppConfig> for UploadConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            allowed_extensions: config.allowed_extensions.clone(),
            max_file_size_bytes: config.max_file_size_bytes,
            min_free_space_bytes: config.min_free_space_bytes,
        }
    }
}

/// A validated upload on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub path: PathBuf,
    /// Lowercase extension with its leading dot.
    pub extension: String,
    pub size_bytes: u64,
}

/// Validates and stores uploads.
pub struct UploadGuard {
    config: UploadConfig,
    disks: parking_lot::Mutex<DiskMonitor>,
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Whole MiB print without decimals, anything else with two.
fn format_mb(bytes: u64) -> String {
    if bytes % (1024 * 1024) == 0 {
        (bytes / (1024 * 1024)).to_string()
    } else {
        format!("{:.2}", mb(bytes))
    }
}

impl UploadGuard {
    pub fn new(config: UploadConfig) -> Self {
        Self {
            config,
            disks: parking_lot::Mutex::new(DiskMonitor::new()),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    fn allowed_list(&self) -> String {
        self.config
            .allowed_extensions
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn max_mb(&self) -> String {
        format_mb(self.config.max_file_size_bytes)
    }

    /// Validate the filename and declared size, returning the normalised
    /// extension.
    pub fn validate(&self, filename: &str, declared_size: Option<u64>) -> Result<String, UploadError> {
        if filename.trim().is_empty() {
            return Err(UploadError::bad_input(
                "Filename is missing. Please provide a valid filename.",
            ));
        }
        if filename.chars().count() > MAX_FILENAME_LEN {
            return Err(UploadError::bad_input(format!(
                "Filename is too long. Maximum length is {MAX_FILENAME_LEN} characters."
            )));
        }
        if filename == "."
            || filename == ".."
            || filename
                .chars()
                .any(|c| c.is_control() || INVALID_FILENAME_CHARS.contains(&c))
        {
            return Err(UploadError::bad_input("Filename contains invalid characters."));
        }

        let Some(extension) = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
        else {
            return Err(UploadError::bad_input(format!(
                "File must have an extension. Allowed types: {}",
                self.allowed_list()
            )));
        };
        if !self.config.allowed_extensions.contains(&extension) {
            warn!(extension = %extension, "Invalid file extension attempted");
            return Err(UploadError::bad_input(format!(
                "Invalid file type '{extension}'. Allowed types: {}",
                self.allowed_list()
            )));
        }

        if let Some(size) = declared_size {
            if size == 0 {
                return Err(UploadError::bad_input(
                    "File size is zero. Please upload a valid audio file.",
                ));
            }
            if size > self.config.max_file_size_bytes {
                return Err(UploadError::too_large(format!(
                    "File too large. Maximum size: {}MB. Your file: {:.2}MB",
                    self.max_mb(),
                    mb(size)
                )));
            }
        }

        Ok(extension)
    }

    /// Validate and stream `reader` to `<upload_dir>/<uuid><ext>`.
    ///
    /// Nothing is left on disk when this returns an error.
    pub async fn store<R>(
        &self,
        filename: &str,
        declared_size: Option<u64>,
        reader: &mut R,
    ) -> Result<StoredUpload, UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let extension = self.validate(filename, declared_size)?;
        let dir = &self.config.upload_dir;

        self.check_free_space(dir)?;
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            warn!(dir = %dir.display(), error = %e, "Failed to create upload directory");
            UploadError::storage_failure("Failed to save uploaded file. Please try again.")
        })?;

        let destination = dir.join(format!("{}{}", uuid::Uuid::new_v4(), extension));
        let written = match self.write_limited(reader, &destination).await {
            Ok(written) => written,
            Err(e) => {
                remove_quietly(&destination).await;
                return Err(e);
            }
        };

        let size_bytes = match tokio::fs::metadata(&destination).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(UploadError::storage_failure(
                    "File was not saved correctly.",
                ));
            }
        };
        if size_bytes == 0 {
            remove_quietly(&destination).await;
            warn!(path = %destination.display(), "Uploaded file is empty");
            return Err(UploadError::bad_input(
                "Uploaded file is empty. Please upload a valid audio file.",
            ));
        }
        if size_bytes > self.config.max_file_size_bytes {
            remove_quietly(&destination).await;
            return Err(UploadError::too_large(format!(
                "File too large. Maximum size: {}MB. Your file: {:.2}MB",
                self.max_mb(),
                mb(size_bytes)
            )));
        }

        info!(
            path = %destination.display(),
            bytes = written,
            original = %filename,
            "File saved successfully"
        );
        Ok(StoredUpload {
            path: destination,
            extension,
            size_bytes,
        })
    }

    fn check_free_space(&self, dir: &Path) -> Result<(), UploadError> {
        let status = self
            .disks
            .lock()
            .check(dir, self.config.min_free_space_bytes);
        match status {
            DiskSpaceStatus::InsufficientSpace { .. } => Err(UploadError::insufficient_storage(
                "Insufficient disk space. Please try again later.",
            )),
            DiskSpaceStatus::Unknown => {
                warn!(dir = %dir.display(), "Could not check disk space; continuing");
                Ok(())
            }
            DiskSpaceStatus::Ok { .. } => Ok(()),
        }
    }

    async fn write_limited<R>(&self, reader: &mut R, destination: &Path) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let io_failure = |e: std::io::Error| {
            warn!(path = %destination.display(), error = %e, "Failed to save upload");
            UploadError::storage_failure("Failed to save uploaded file. Please try again.")
        };

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(io_failure)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;

        loop {
            let read = reader.read(&mut buffer).await.map_err(io_failure)?;
            if read == 0 {
                break;
            }
            written += read as u64;
            if written > self.config.max_file_size_bytes {
                debug!(written, "Upload exceeded maximum size, aborting");
                return Err(UploadError::too_large(format!(
                    "File too large. Maximum size: {}MB. Uploaded: {:.2}MB",
                    self.max_mb(),
                    mb(written)
                )));
            }
            file.write_all(&buffer[..read]).await.map_err(io_failure)?;
        }

        file.flush().await.map_err(io_failure)?;
        Ok(written)
    }
}

/// Parse the requested stem count, rejecting anything but 2, 4 or 5 as bad input.
pub fn parse_stem_count(raw: &str) -> Result<StemCount, UploadError> {
    raw.parse::<StemCount>().map_err(|e| match e {
        crate::Error::Validation(message) => UploadError::bad_input(message),
        other => UploadError::bad_input(other.to_string()),
    })
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove rejected upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_extension_list;
    use tempfile::TempDir;

    fn guard(dir: &Path, max: u64) -> UploadGuard {
        UploadGuard::new(UploadConfig {
            upload_dir: dir.to_path_buf(),
            allowed_extensions: parse_extension_list(".mp3,.wav,.flac"),
            max_file_size_bytes: max,
            min_free_space_bytes: 0,
        })
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_rejects_bad_names() {
        let temp = TempDir::new().unwrap();
        let guard = guard(temp.path(), 1024);

        for name in ["", "..", "a/b.mp3", "a\\b.mp3", "a:b.mp3", "a?.mp3", "nul\0.mp3", "tab\t.mp3"] {
            let err = guard.validate(name, None).unwrap_err();
            assert_eq!(err.kind, RejectionKind::BadInput, "{name:?}");
        }

        let long = format!("{}.mp3", "a".repeat(252));
        assert!(guard.validate(&long, None).is_err());
        let fits = format!("{}.mp3", "a".repeat(251));
        assert!(guard.validate(&fits, None).is_ok());
    }

    #[test]
    fn test_extension_allow_list() {
        let temp = TempDir::new().unwrap();
        let guard = guard(temp.path(), 1024);

        assert_eq!(guard.validate("Song.MP3", None).unwrap(), ".mp3");
        let err = guard.validate("song.exe", None).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            err.message,
            "Invalid file type '.exe'. Allowed types: .flac, .mp3, .wav"
        );
        let err = guard.validate("song", None).unwrap_err();
        assert!(err.message.starts_with("File must have an extension"));
    }

    #[test]
    fn test_declared_size_limits() {
        let temp = TempDir::new().unwrap();
        let guard = guard(temp.path(), 1024);

        assert_eq!(
            guard.validate("a.wav", Some(0)).unwrap_err().kind,
            RejectionKind::BadInput
        );
        assert_eq!(
            guard.validate("a.wav", Some(1025)).unwrap_err().status_code(),
            413
        );
        assert!(guard.validate("a.wav", Some(1024)).is_ok());
    }

    #[tokio::test]
    async fn test_store_writes_uuid_named_file() {
        let temp = TempDir::new().unwrap();
        let guard = guard(&temp.path().join("uploads"), 1024 * 1024);
        let payload = vec![7u8; 200 * 1024];

        let stored = guard
            .store("My Song.FLAC", Some(payload.len() as u64), &mut payload.as_slice())
            .await
            .unwrap();

        assert_eq!(stored.size_bytes, payload.len() as u64);
        assert_eq!(stored.extension, ".flac");
        let name = stored.path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".flac"));
        assert!(uuid::Uuid::parse_str(name.trim_end_matches(".flac")).is_ok());
        assert_eq!(std::fs::read(&stored.path).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_store_aborts_when_stream_exceeds_limit() {
        let temp = TempDir::new().unwrap();
        let guard = guard(temp.path(), 100 * 1024);
        let payload = vec![1u8; 300 * 1024];

        // The client claims a small file but sends more.
        let err = guard
            .store("a.mp3", Some(10), &mut payload.as_slice())
            .await
            .unwrap_err();

        assert_eq!(err.kind, RejectionKind::TooLarge);
        assert!(err.message.contains("Maximum size: 0.10MB"));
        assert!(err.message.contains("Uploaded:"));
        assert_eq!(files_in(temp.path()), 0);
    }

    #[tokio::test]
    async fn test_store_rejects_empty_stream() {
        let temp = TempDir::new().unwrap();
        let guard = guard(temp.path(), 1024);
        let payload: &[u8] = &[];

        let err = guard
            .store("a.wav", None, &mut &payload[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::BadInput);
        assert_eq!(files_in(temp.path()), 0);
    }

    #[tokio::test]
    async fn test_rejected_name_touches_nothing() {
        let temp = TempDir::new().unwrap();
        let uploads = temp.path().join("uploads");
        let guard = guard(&uploads, 1024);

        let err = guard
            .store("../etc/passwd.mp3", None, &mut &b"x"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::BadInput);
        assert!(!uploads.exists());
    }

    #[tokio::test]
    async fn test_insufficient_space_rejects_before_creating_directory() {
        let temp = TempDir::new().unwrap();
        if DiskMonitor::new().check(temp.path(), 0) == DiskSpaceStatus::Unknown {
            return;
        }
        let uploads = temp.path().join("uploads");
        let guard = UploadGuard::new(UploadConfig {
            min_free_space_bytes: u64::MAX,
            ..guard(&uploads, 1024).config().clone()
        });

        let err = guard
            .store("a.wav", Some(4), &mut &b"RIFF"[..])
            .await
            .unwrap_err();
        assert_eq!(err.kind, RejectionKind::InsufficientStorage);
        assert_eq!(err.status_code(), 507);
        assert!(!uploads.exists());
    }

    #[test]
    fn test_size_limit_formatting() {
        assert_eq!(format_mb(100 * 1024 * 1024), "100");
        assert_eq!(format_mb(1024 * 1024), "1");
        assert_eq!(format_mb(100 * 1024), "0.10");
        assert_eq!(format_mb(1536 * 1024), "1.50");

        let temp = TempDir::new().unwrap();
        let err = guard(temp.path(), 512 * 1024)
            .validate("a.mp3", Some(600 * 1024))
            .unwrap_err();
        assert_eq!(
            err.message,
            "File too large. Maximum size: 0.50MB. Your file: 0.59MB"
        );
    }

    #[test]
    fn test_parse_stem_count() {
        assert_eq!(parse_stem_count("4").unwrap(), StemCount::Four);
        let err = parse_stem_count("3").unwrap_err();
        assert_eq!(err.kind, RejectionKind::BadInput);
        assert_eq!(err.message, "Invalid stems value: 3. Must be 2, 4, or 5.");
        assert!(parse_stem_count("two").is_err());
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(RejectionKind::BadInput.status_code(), 400);
        assert_eq!(RejectionKind::TooLarge.status_code(), 413);
        assert_eq!(RejectionKind::InsufficientStorage.status_code(), 507);
        assert_eq!(RejectionKind::StorageFailure.status_code(), 500);
    }
}
