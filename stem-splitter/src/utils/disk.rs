//! Free disk space checks.

use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

/// Result of a disk space check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSpaceStatus {
    /// Sufficient space available.
    Ok {
        /// Available space in bytes.
        available_bytes: u64,
    },
    /// Insufficient space.
    InsufficientSpace {
        /// Available space in bytes.
        available_bytes: u64,
        /// Required space in bytes.
        required_bytes: u64,
    },
    /// Could not determine disk space.
    Unknown,
}

impl DiskSpaceStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DiskSpaceStatus::Ok { .. })
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, DiskSpaceStatus::InsufficientSpace { .. })
    }

    pub fn available_bytes(&self) -> Option<u64> {
        match self {
            Self::Ok { available_bytes } | Self::InsufficientSpace { available_bytes, .. } => {
                Some(*available_bytes)
            }
            Self::Unknown => None,
        }
    }
}

/// Disk space monitor backed by `sysinfo`.
#[derive(Debug, Default)]
pub struct DiskMonitor {
    disks: Disks,
}

impl DiskMonitor {
    pub fn new() -> Self {
        Self {
            disks: Disks::new_with_refreshed_list(),
        }
    }

    /// Check that the volume holding `path` has at least `required_bytes` free.
    pub fn check(&mut self, path: &Path, required_bytes: u64) -> DiskSpaceStatus {
        self.disks = Disks::new_with_refreshed_list();

        let Some(available_bytes) = self.available_space_for(path) else {
            warn!(path = %path.display(), "Could not determine disk space");
            return DiskSpaceStatus::Unknown;
        };

        if available_bytes >= required_bytes {
            debug!(available_bytes, required_bytes, "Disk space OK");
            DiskSpaceStatus::Ok { available_bytes }
        } else {
            warn!(available_bytes, required_bytes, path = %path.display(), "Insufficient disk space");
            DiskSpaceStatus::InsufficientSpace {
                available_bytes,
                required_bytes,
            }
        }
    }

    /// Free space on the disk with the longest mount point containing `path`.
    fn available_space_for(&self, path: &Path) -> Option<u64> {
        let path = resolve(path);
        self.disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Absolute form of `path`, resolved through its closest existing ancestor.
fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    absolute
        .ancestors()
        .find_map(|ancestor| {
            let canonical = ancestor.canonicalize().ok()?;
            let rest = absolute.strip_prefix(ancestor).ok()?;
            Some(canonical.join(rest))
        })
        .unwrap_or(absolute)
}
