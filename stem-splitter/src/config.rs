//! Process configuration loaded from the environment.
//!
//! Every setting has a default, so an empty environment yields a working
//! configuration rooted at `temp/` in the current directory. Values that fail
//! to parse are ignored with a warning and the default is kept.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::StemCount;
use crate::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Backend used for durable job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Records live only in process memory and are lost on restart.
    Memory,
    /// One JSON record per job under `jobs_dir`.
    #[default]
    File,
}

impl FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "file" | "disk" => Ok(Self::File),
            other => Err(Error::config(format!("Unknown store backend: {other}"))),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory that receives validated uploads.
    pub upload_dir: PathBuf,
    /// Directory the engine writes into and archives are placed in.
    pub output_dir: PathBuf,
    /// Directory holding one record per job (file backend only).
    pub jobs_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Job record backend.
    pub store_backend: StoreBackend,
    /// Accepted upload extensions, lowercase with a leading dot.
    pub allowed_extensions: BTreeSet<String>,
    /// Maximum accepted upload size in bytes.
    pub max_file_size_bytes: u64,
    /// Minimum free space required on the upload volume before writing.
    pub min_free_space_bytes: u64,
    /// Number of engine invocations allowed to run at the same time.
    pub max_concurrent_separations: usize,
    /// Program invoked by the command engine.
    pub engine_program: String,
    /// Engine call timeout in seconds. 0 disables the timeout.
    pub engine_timeout_secs: u64,
    /// Delay before a completed job's files are removed.
    pub cleanup_delay_secs: u64,
    /// Age past completion after which the sweeper retires a job.
    /// 0 disables retirement.
    pub retention_secs: u64,
    /// Interval between sweeper passes.
    pub sweep_interval_secs: u64,
    /// How long shutdown waits for supervised tasks before aborting them.
    pub shutdown_timeout_secs: u64,
    /// Engine variants loaded in the background at startup.
    pub prewarm_stems: Vec<StemCount>,
    /// Operations slower than this many milliseconds are logged as warnings.
    pub slow_operation_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("temp/uploads"),
            output_dir: PathBuf::from("temp/output"),
            jobs_dir: PathBuf::from("temp/jobs"),
            log_dir: PathBuf::from("logs"),
            store_backend: StoreBackend::File,
            allowed_extensions: [".mp3", ".wav", ".ogg", ".flac", ".m4a"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_size_bytes: 100 * MIB,
            min_free_space_bytes: 200 * MIB,
            max_concurrent_separations: 3,
            engine_program: "spleeter".to_string(),
            engine_timeout_secs: 7200,
            cleanup_delay_secs: 3600,
            retention_secs: 3600,
            sweep_interval_secs: 3600,
            shutdown_timeout_secs: 30,
            prewarm_stems: vec![StemCount::Two, StemCount::Four],
            slow_operation_ms: 1000,
        }
    }
}

impl AppConfig {
    /// Default configuration with every directory placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            upload_dir: root.join("uploads"),
            output_dir: root.join("output"),
            jobs_dir: root.join("jobs"),
            log_dir: root.join("logs"),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars: `UPLOAD_DIR`, `OUTPUT_DIR`, `JOBS_DIR`, `LOG_DIR`,
    /// `STORE_BACKEND`, `ALLOWED_EXTENSIONS`, `MAX_FILE_SIZE_MB`,
    /// `MIN_FREE_SPACE_MB`, `MAX_CONCURRENT_SEPARATIONS`, `ENGINE_PROGRAM`,
    /// `ENGINE_TIMEOUT_SECS`, `CLEANUP_DELAY_SECS`, `RETENTION_SECS`,
    /// `SWEEP_INTERVAL_SECS`, `SHUTDOWN_TIMEOUT_SECS`, `PREWARM_STEMS`,
    /// `SLOW_OPERATION_MS`.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        env_path("UPLOAD_DIR", &mut config.upload_dir);
        env_path("OUTPUT_DIR", &mut config.output_dir);
        env_path("JOBS_DIR", &mut config.jobs_dir);
        env_path("LOG_DIR", &mut config.log_dir);
        env_parse("STORE_BACKEND", &mut config.store_backend);

        if let Some(raw) = env_value("ALLOWED_EXTENSIONS") {
            let extensions = parse_extension_list(&raw);
            if extensions.is_empty() {
                warn!(value = %raw, "ALLOWED_EXTENSIONS is empty; keeping defaults");
            } else {
                config.allowed_extensions = extensions;
            }
        }

        let mut max_file_size_mb = config.max_file_size_bytes / MIB;
        env_parse("MAX_FILE_SIZE_MB", &mut max_file_size_mb);
        config.max_file_size_bytes = max_file_size_mb.saturating_mul(MIB);

        let mut min_free_space_mb = config.min_free_space_bytes / MIB;
        env_parse("MIN_FREE_SPACE_MB", &mut min_free_space_mb);
        config.min_free_space_bytes = min_free_space_mb.saturating_mul(MIB);

        env_parse(
            "MAX_CONCURRENT_SEPARATIONS",
            &mut config.max_concurrent_separations,
        );
        if let Some(program) = env_value("ENGINE_PROGRAM") {
            config.engine_program = program;
        }
        env_parse("ENGINE_TIMEOUT_SECS", &mut config.engine_timeout_secs);
        env_parse("CLEANUP_DELAY_SECS", &mut config.cleanup_delay_secs);
        env_parse("RETENTION_SECS", &mut config.retention_secs);
        env_parse("SWEEP_INTERVAL_SECS", &mut config.sweep_interval_secs);
        env_parse("SHUTDOWN_TIMEOUT_SECS", &mut config.shutdown_timeout_secs);
        env_parse("SLOW_OPERATION_MS", &mut config.slow_operation_ms);

        if let Some(raw) = env_value("PREWARM_STEMS") {
            config.prewarm_stems = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .filter_map(|s| match s.parse::<StemCount>() {
                    Ok(stems) => Some(stems),
                    Err(e) => {
                        warn!(value = %s, error = %e, "Ignoring PREWARM_STEMS entry");
                        None
                    }
                })
                .collect();
        }

        config
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_separations == 0 {
            return Err(Error::config(
                "max_concurrent_separations must be at least 1",
            ));
        }
        if self.allowed_extensions.is_empty() {
            return Err(Error::config("allowed_extensions must not be empty"));
        }
        if self.max_file_size_bytes == 0 {
            return Err(Error::config("max_file_size_bytes must be greater than 0"));
        }
        Ok(())
    }

    /// Engine timeout, or `None` when disabled.
    pub fn engine_timeout(&self) -> Option<Duration> {
        (self.engine_timeout_secs > 0).then(|| Duration::from_secs(self.engine_timeout_secs))
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn slow_operation(&self) -> Duration {
        Duration::from_millis(self.slow_operation_ms)
    }
}

/// Parse a comma separated extension list into normalised `.ext` entries.
pub fn parse_extension_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_extension)
        .collect()
}

/// Lowercase an extension and make sure it starts with a dot.
pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_path(key: &str, target: &mut PathBuf) {
    if let Some(raw) = env_value(key) {
        *target = PathBuf::from(raw);
    }
}

fn env_parse<T>(key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env_value(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(e) => warn!(key, value = %raw, error = %e, "Ignoring invalid environment value"),
        }
    }
}
