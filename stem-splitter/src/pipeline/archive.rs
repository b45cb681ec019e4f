//! Packages an engine output directory into a single zip archive.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::{Error, Result};

/// Default cap on the total uncompressed size of an archive.
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 500 * 1024 * 1024;

/// Outcome of a successful archive build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub entries_written: usize,
    pub entries_skipped: usize,
    pub uncompressed_bytes: u64,
    pub archive_bytes: u64,
}

/// Builds deflate-compressed zip archives from a directory tree.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveBuilder {
    max_total_bytes: u64,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self {
            max_total_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
        }
    }
}

struct PendingEntry {
    path: PathBuf,
    name: String,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_total_bytes(mut self, max_total_bytes: u64) -> Self {
        self.max_total_bytes = max_total_bytes;
        self
    }

    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_bytes
    }

    /// Archive every regular file under `source_dir` into `archive_path`.
    ///
    /// Blocking; run it on a blocking worker. On error no archive is left
    /// at `archive_path`.
    pub fn build(&self, source_dir: &Path, archive_path: &Path) -> Result<ArchiveSummary> {
        info!(
            source = %source_dir.display(),
            archive = %archive_path.display(),
            "Creating archive"
        );

        let meta = std::fs::metadata(source_dir)
            .map_err(|_| Error::archive("Source directory does not exist for zip creation."))?;
        if !meta.is_dir() {
            return Err(Error::archive("Source path is not a directory."));
        }
        let mut children = std::fs::read_dir(source_dir)
            .map_err(|e| Error::io_path("reading directory", source_dir, e))?;
        if children.next().is_none() {
            return Err(Error::archive("Source directory is empty. No files to zip."));
        }

        let (entries, total_bytes, duplicates) = self.collect(source_dir)?;

        if archive_path.exists() {
            warn!(archive = %archive_path.display(), "Archive already exists, removing");
            std::fs::remove_file(archive_path)
                .map_err(|e| Error::io_path("removing existing archive", archive_path, e))?;
        }
        if let Some(parent) = archive_path.parent() {
            crate::utils::fs::ensure_dir_all_sync(parent)?;
        }

        match Self::write(&entries, archive_path) {
            Ok((written, skipped)) if written > 0 => {
                let skipped = skipped + duplicates;
                let archive_bytes = std::fs::metadata(archive_path)
                    .map(|m| m.len())
                    .unwrap_or(0);
                let summary = ArchiveSummary {
                    entries_written: written,
                    entries_skipped: skipped,
                    uncompressed_bytes: total_bytes,
                    archive_bytes,
                };
                info!(
                    archive = %archive_path.display(),
                    entries = written,
                    skipped,
                    uncompressed_mb = total_bytes as f64 / (1024.0 * 1024.0),
                    "Archive created"
                );
                Ok(summary)
            }
            Ok(_) => {
                let _ = std::fs::remove_file(archive_path);
                Err(Error::archive("No files were added to the zip archive."))
            }
            Err(e) => {
                let _ = std::fs::remove_file(archive_path);
                Err(e)
            }
        }
    }

    /// Walk the tree once, gathering regular files and their entry names.
    ///
    /// Entry names are unique; a file whose name is already taken is
    /// skipped and counted in the returned duplicate total.
    fn collect(&self, source_dir: &Path) -> Result<(Vec<PendingEntry>, u64, usize)> {
        let mut entries = Vec::new();
        let mut names = HashSet::new();
        let mut duplicates = 0;
        let mut total_bytes: u64 = 0;

        for entry in WalkDir::new(source_dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                if !entry.file_type().is_dir() {
                    warn!(path = %entry.path().display(), "Skipping non-file");
                }
                continue;
            }

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Could not get file size");
                    continue;
                }
            };

            let name = entry_name(source_dir, entry.path());
            if !names.insert(name.clone()) {
                warn!(
                    path = %entry.path().display(),
                    name = %name,
                    "Skipping file, archive entry name already used"
                );
                duplicates += 1;
                continue;
            }

            total_bytes = total_bytes.saturating_add(size);
            if total_bytes > self.max_total_bytes {
                return Err(Error::archive("Output zip file would be too large."));
            }

            entries.push(PendingEntry {
                name,
                path: entry.into_path(),
            });
        }

        Ok((entries, total_bytes, duplicates))
    }

    fn write(entries: &[PendingEntry], archive_path: &Path) -> Result<(usize, usize)> {
        let file = File::create(archive_path)
            .map_err(|e| Error::io_path("creating archive", archive_path, e))?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let mut written = 0;
        let mut skipped = 0;
        for entry in entries {
            let mut buffer = Vec::new();
            if let Err(e) = File::open(&entry.path).and_then(|mut f| f.read_to_end(&mut buffer)) {
                warn!(path = %entry.path.display(), error = %e, "Failed to add file to archive");
                skipped += 1;
                continue;
            }

            debug!(name = %entry.name, bytes = buffer.len(), "Adding archive entry");
            if let Err(e) = zip.start_file(entry.name.as_str(), options) {
                warn!(name = %entry.name, error = %e, "Failed to start archive entry");
                skipped += 1;
                continue;
            }
            zip.write_all(&buffer)
                .map_err(|e| Error::archive(format!("Failed to write to ZIP archive: {e}")))?;
            written += 1;
        }

        zip.finish()
            .map_err(|e| Error::archive(format!("Failed to finalize ZIP archive: {e}")))?;
        Ok((written, skipped))
    }
}

/// `/`-separated path of `path` relative to `root`, collapsed to the base
/// name if it would escape the archive root.
fn entry_name(root: &Path, path: &Path) -> String {
    let base_name = || {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let Ok(relative) = path.strip_prefix(root) else {
        return base_name();
    };

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return base_name(),
        }
    }
    if parts.iter().any(|p| p.contains("..")) {
        return base_name();
    }
    parts.join("/")
}
