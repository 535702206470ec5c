//! Clip directory management and quota enforcement.
//!
//! The clip directory is flat. Only files whose names follow the clip naming
//! scheme are counted against the quota; hidden `.part` files belong to
//! in-flight writes and are never evicted while the recorder runs.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clip::ClipName;
use crate::error::{Error, Result};

/// A completed clip found in the clip directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredClip {
    /// Full path.
    pub path: PathBuf,
    /// Parsed file name.
    pub name: ClipName,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

/// Outcome of one quota pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Bytes used before the pass.
    pub total_before: u64,
    /// Bytes used after the pass.
    pub total_after: u64,
    /// Clips removed, oldest first.
    pub deleted: Vec<PathBuf>,
    /// Clips that could not be removed.
    pub failed: Vec<PathBuf>,
}

impl EvictionReport {
    /// Whether the pass removed anything.
    #[must_use]
    pub fn evicted_any(&self) -> bool {
        !self.deleted.is_empty()
    }
}

/// Clip directory statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    /// Number of completed clips.
    pub clip_count: usize,
    /// Bytes used by completed clips.
    pub total_bytes: u64,
    /// Configured quota.
    pub max_bytes: u64,
    /// Modification time of the oldest clip.
    pub oldest_clip: Option<DateTime<Utc>>,
    /// Modification time of the newest clip.
    pub newest_clip: Option<DateTime<Utc>>,
}

/// Owns the clip directory and keeps it under its byte quota.
#[derive(Debug)]
pub struct StorageManager {
    dir: PathBuf,
    max_bytes: u64,
    target_ratio: f64,
    // Serializes quota passes so two extractors never evict the same file.
    lock: Mutex<()>,
}

impl StorageManager {
    /// Create a manager for `dir`.
    ///
    /// Eviction starts when usage exceeds `max_bytes` and stops once usage
    /// is at or below `max_bytes * target_ratio`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, target_ratio: f64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            target_ratio: target_ratio.clamp(0.0, 1.0),
            lock: Mutex::new(()),
        }
    }

    /// The clip directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The byte quota.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Usage a quota pass brings the directory down to.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.target_ratio) as u64
    }

    /// Create the clip directory if missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryCreate`] if it cannot be created.
    pub fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|source| Error::DirectoryCreate {
                path: self.dir.clone(),
                source,
            })?;
            info!("Created clip directory {}", self.dir.display());
        }
        Ok(())
    }

    /// Completed clips, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageIo`] if the directory cannot be read.
    pub fn list_clips(&self) -> Result<Vec<StoredClip>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| Error::StorageIo {
            path: self.dir.clone(),
            source,
        })?;

        let mut clips = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Ok(name) = file_name.parse::<ClipName>() else {
                continue;
            };
            // Clips can vanish between read_dir and stat.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            clips.push(StoredClip {
                path: entry.path(),
                name,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        clips.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(clips)
    }

    /// Delete oldest clips until usage is back under the target.
    ///
    /// Nothing is deleted unless usage exceeds the quota. A clip that cannot
    /// be deleted is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageIo`] if the directory cannot be read.
    pub fn enforce_quota(&self) -> Result<EvictionReport> {
        self.evict_with(|path| std::fs::remove_file(path))
    }

    fn evict_with<F>(&self, mut remove: F) -> Result<EvictionReport>
    where
        F: FnMut(&Path) -> io::Result<()>,
    {
        let _guard = self.lock.lock();

        let clips = self.list_clips()?;
        let total_before: u64 = clips.iter().map(|c| c.size).sum();
        let mut report = EvictionReport {
            total_before,
            total_after: total_before,
            ..EvictionReport::default()
        };

        if total_before <= self.max_bytes {
            return Ok(report);
        }

        let target = self.target_bytes();
        for clip in clips {
            if report.total_after <= target {
                break;
            }
            match remove(&clip.path) {
                Ok(()) => {
                    debug!(path = %clip.path.display(), size = clip.size, "evicted clip");
                    report.total_after = report.total_after.saturating_sub(clip.size);
                    report.deleted.push(clip.path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.total_after = report.total_after.saturating_sub(clip.size);
                }
                Err(e) => {
                    warn!(path = %clip.path.display(), error = %e, "failed to evict clip");
                    report.failed.push(clip.path);
                }
            }
        }

        info!(
            "Evicted {} clips ({} -> {} bytes, quota {})",
            report.deleted.len(),
            report.total_before,
            report.total_after,
            self.max_bytes
        );
        Ok(report)
    }

    /// Remove `.part` files left behind by an interrupted run.
    ///
    /// Only call this before any extraction has started. A `.part` file
    /// may be an in-flight write of a running recorder, so nothing else
    /// deletes them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageIo`] if the directory cannot be read.
    pub fn sweep_partials(&self) -> Result<usize> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| Error::StorageIo {
            path: self.dir.clone(),
            source,
        })?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            if !file_name.to_str().is_some_and(ClipName::is_partial) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove partial clip"),
            }
        }

        if removed > 0 {
            info!("Removed {} partial clips from a previous run", removed);
        }
        Ok(removed)
    }

    /// Directory statistics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageIo`] if the directory cannot be read.
    pub fn stats(&self) -> Result<StorageStats> {
        let clips = self.list_clips()?;
        Ok(StorageStats {
            clip_count: clips.len(),
            total_bytes: clips.iter().map(|c| c.size).sum(),
            max_bytes: self.max_bytes,
            oldest_clip: clips.first().map(|c| DateTime::<Utc>::from(c.modified)),
            newest_clip: clips.last().map(|c| DateTime::<Utc>::from(c.modified)),
        })
    }
}
