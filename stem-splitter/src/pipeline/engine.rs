//! Separation engine interface and the default command-line implementation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::jobs::StemCount;

/// Errors reported by a separation engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine ran and reported a failure. The message is kept verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Separation completed but output files were not found.")]
    OutputMissing(PathBuf),

    #[error("Separation engine unavailable: {0}")]
    Unavailable(String),

    #[error("Separation engine crashed: {0}")]
    Crashed(String),
}

/// A loaded engine able to separate one track per call.
///
/// Dropping the returned future abandons the separation. Engines that run
/// an external program stop it when that happens.
#[async_trait]
pub trait SeparationEngine: Send + Sync {
    /// Separate `input` into `stems`, returning the directory holding the
    /// produced files.
    async fn separate(&self, input: &Path, stems: StemCount) -> Result<PathBuf, EngineError>;

    /// Where output for `input` would be written, if the engine knows it
    /// up front. Used to remove partial output of an abandoned call.
    fn output_dir_for(&self, _input: &Path) -> Option<PathBuf> {
        None
    }
}

/// Produces engine handles, one per stem-count variant.
pub trait EngineFactory: Send + Sync {
    /// Build a handle for `stems`. May be slow (model loading).
    fn create(&self, stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError>;
}

/// An in-process separator whose calls block the current thread.
pub trait BlockingSeparator: Send + Sync + 'static {
    fn separate_blocking(&self, input: &Path, stems: StemCount) -> Result<PathBuf, EngineError>;
}

/// Adapts a [`BlockingSeparator`] by running each call on the blocking pool.
///
/// An abandoned call cannot be interrupted and runs to completion on its
/// worker thread.
pub struct BlockingEngine<S> {
    separator: Arc<S>,
}

impl<S: BlockingSeparator> BlockingEngine<S> {
    pub fn new(separator: S) -> Self {
        Self {
            separator: Arc::new(separator),
        }
    }
}

#[async_trait]
impl<S: BlockingSeparator> SeparationEngine for BlockingEngine<S> {
    async fn separate(&self, input: &Path, stems: StemCount) -> Result<PathBuf, EngineError> {
        let separator = self.separator.clone();
        let input = input.to_path_buf();
        tokio::task::spawn_blocking(move || separator.separate_blocking(&input, stems))
            .await
            .map_err(|e| EngineError::Crashed(e.to_string()))?
    }
}

/// Engine that shells out to a `spleeter`-compatible program.
///
/// Runs `<program> separate -p spleeter:{N}stems -o <output_root> <input>`
/// and expects `<output_root>/<input stem>/` afterwards. The child process is
/// killed if the call is dropped before it exits.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    output_root: PathBuf,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_root: output_root.into(),
        }
    }

    /// Directory the program writes the stems of `input` into.
    pub fn output_dir(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        self.output_root.join(stem)
    }

    fn command(&self, input: &Path, stems: StemCount) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("separate")
            .arg("-p")
            .arg(stems.model_name())
            .arg("-o")
            .arg(&self.output_root)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl SeparationEngine for CommandEngine {
    async fn separate(&self, input: &Path, stems: StemCount) -> Result<PathBuf, EngineError> {
        let output_dir = self.output_dir(input);
        info!(input = %input.display(), stems = %stems, "Running separation");

        let mut child = self
            .command(input, stems)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Keep the last non-empty stderr line; it carries the failure reason.
        let stderr_handle = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut last = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim();
                    if !line.is_empty() {
                        debug!("stderr: {}", line);
                        last = Some(line.to_string());
                    }
                }
                last
            })
        });

        let status = child.wait().await.map_err(|e| {
            EngineError::Crashed(format!("Failed to wait for {}: {e}", self.program))
        })?;
        let last_line = match stderr_handle {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };

        if !status.success() {
            let message =
                last_line.unwrap_or_else(|| format!("{} exited with {}", self.program, status));
            warn!(input = %input.display(), error = %message, "Separation failed");
            if let Err(e) = tokio::fs::remove_dir_all(&output_dir).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %output_dir.display(), error = %e, "Failed to remove partial output");
            }
            return Err(EngineError::Failed(message));
        }

        if !tokio::fs::metadata(&output_dir)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Err(EngineError::OutputMissing(output_dir));
        }

        debug!(output = %output_dir.display(), "Separation output created");
        Ok(output_dir)
    }

    fn output_dir_for(&self, input: &Path) -> Option<PathBuf> {
        Some(self.output_dir(input))
    }
}

/// Factory for [`CommandEngine`] handles.
#[derive(Debug, Clone)]
pub struct CommandEngineFactory {
    program: String,
    output_root: PathBuf,
}

impl CommandEngineFactory {
    pub fn new(program: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_root: output_root.into(),
        }
    }
}

impl EngineFactory for CommandEngineFactory {
    fn create(&self, stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError> {
        debug!(program = %self.program, stems = %stems, "Creating command engine");
        Ok(Arc::new(CommandEngine::new(
            self.program.clone(),
            self.output_root.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Write an executable shell script standing in for the engine program.
    #[cfg(unix)]
    fn fake_program(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-engine.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_output_dir_uses_input_stem() {
        let engine = CommandEngine::new("spleeter", "/srv/output");
        assert_eq!(
            engine.output_dir(Path::new("/srv/uploads/3f2a.mp3")),
            PathBuf::from("/srv/output/3f2a")
        );
        assert_eq!(
            engine.output_dir_for(Path::new("/srv/uploads/3f2a.mp3")),
            Some(PathBuf::from("/srv/output/3f2a"))
        );
    }

    #[test]
    fn test_command_arguments() {
        let engine = CommandEngine::new("spleeter", "/srv/output");
        let command = engine.command(Path::new("/srv/uploads/a.wav"), StemCount::Five);
        let command = command.as_std();
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(command.get_program(), "spleeter");
        assert_eq!(
            args,
            vec![
                "separate",
                "-p",
                "spleeter:5stems",
                "-o",
                "/srv/output",
                "/srv/uploads/a.wav"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let engine = CommandEngine::new("definitely-not-a-real-engine-binary", temp.path());
        let err = engine
            .separate(&temp.path().join("a.mp3"), StemCount::Two)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_reports_last_stderr_line() {
        let temp = tempfile::TempDir::new().unwrap();
        let program = fake_program(
            temp.path(),
            "echo 'loading model' >&2\necho 'ValueError: bad audio' >&2\necho '' >&2\nexit 1",
        );
        let output = temp.path().join("output");
        std::fs::create_dir_all(output.join("a")).unwrap();
        let engine = CommandEngine::new(program, &output);

        let err = engine
            .separate(&temp.path().join("a.mp3"), StemCount::Two)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "ValueError: bad audio");
        assert!(!output.join("a").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_requires_output_directory() {
        let temp = tempfile::TempDir::new().unwrap();
        let output = temp.path().join("output");
        let program = fake_program(temp.path(), "mkdir -p \"$5/$(basename \"$6\" .mp3)\"");
        let engine = CommandEngine::new(program, &output);
        let dir = engine
            .separate(&temp.path().join("a.mp3"), StemCount::Two)
            .await
            .unwrap();
        assert_eq!(dir, output.join("a"));

        let silent = fake_program(temp.path(), "exit 0");
        let engine = CommandEngine::new(silent, &output);
        let err = engine
            .separate(&temp.path().join("b.mp3"), StemCount::Two)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OutputMissing(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_the_call_kills_the_program() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("finished");
        let program = fake_program(
            temp.path(),
            &format!("sleep 2\ntouch '{}'", marker.display()),
        );
        let engine = CommandEngine::new(program, temp.path().join("output"));

        let input = temp.path().join("a.mp3");
        let call = engine.separate(&input, StemCount::Two);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), call)
                .await
                .is_err()
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!marker.exists());
    }

    struct Echo;

    impl BlockingSeparator for Echo {
        fn separate_blocking(&self, input: &Path, _stems: StemCount) -> Result<PathBuf, EngineError> {
            Ok(input.with_extension(""))
        }
    }

    #[tokio::test]
    async fn test_blocking_engine_runs_on_blocking_pool() {
        let engine = BlockingEngine::new(Echo);
        let out = engine
            .separate(Path::new("/uploads/a.mp3"), StemCount::Two)
            .await
            .unwrap();
        assert_eq!(out, PathBuf::from("/uploads/a"));
        assert!(engine.output_dir_for(Path::new("/uploads/a.mp3")).is_none());
    }
}
