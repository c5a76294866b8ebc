//! Cross-process atomic index rebuilds.
//!
//! Serializes writers for one collection via an advisory `flock` held for
//! the entire build, then swaps the finished artifact into place with a
//! single `rename(2)`. Readers never acquire this lock: an open file
//! descriptor keeps observing the pre-swap inode until closed, and a fresh
//! open after the swap observes the new contents. Lock contention is thus
//! between writers only.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fs2::FileExt;

use crate::error::{IndexError, Result};

/// Files/directories older than this are considered abandoned by a crashed
/// rebuilder and are safe to delete before a new build starts.
pub const ORPHAN_TMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Per-collection rebuild coordinator. Cheap to construct; all state lives
/// on disk (the lock file and the collection directory).
pub struct AtomicRebuilder {
    collection_dir: PathBuf,
    lock_path: PathBuf,
}

impl AtomicRebuilder {
    pub fn new(collection_dir: impl Into<PathBuf>) -> Self {
        let collection_dir = collection_dir.into();
        let lock_path = collection_dir.join(".index_rebuild.lock");
        Self {
            collection_dir,
            lock_path,
        }
    }

    /// Acquires the exclusive lock (blocking), cleans up orphaned temp
    /// artifacts, runs `build_fn` against `target.tmp`, and on success
    /// atomically swaps it into `target`. On failure the temp artifact is
    /// removed and the lock released without touching `target`.
    ///
    /// The lock is held for the entire build, not merely the swap: this is
    /// what serializes the daemon against a standalone rebuild tool while
    /// letting queries proceed without ever touching this lock.
    pub fn rebuild_with_lock<F>(&self, target: &Path, build_fn: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        fs::create_dir_all(&self.collection_dir)?;
        let lock_file = File::create(&self.lock_path)?;
        lock_file.lock_exclusive().map_err(IndexError::Io)?;

        let result = (|| {
            cleanup_orphaned_temp(&self.collection_dir, ORPHAN_TMP_MAX_AGE)?;
            let tmp = tmp_path(target);
            match build_fn(&tmp) {
                Ok(()) => {
                    atomic_swap(&tmp, target)?;
                    Ok(())
                }
                Err(e) => {
                    let _ = remove_tmp(&tmp);
                    Err(e)
                }
            }
        })();

        FileExt::unlock(&lock_file).ok();
        result
    }

    /// Non-blocking variant; used only by tooling that must not wait.
    /// Returns `LockContention` if another rebuild is in progress.
    pub fn try_rebuild_with_lock<F>(&self, target: &Path, build_fn: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        fs::create_dir_all(&self.collection_dir)?;
        let lock_file = File::create(&self.lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(IndexError::LockContention(self.collection_dir.clone()));
        }

        let result = (|| {
            cleanup_orphaned_temp(&self.collection_dir, ORPHAN_TMP_MAX_AGE)?;
            let tmp = tmp_path(target);
            match build_fn(&tmp) {
                Ok(()) => {
                    atomic_swap(&tmp, target)?;
                    Ok(())
                }
                Err(e) => {
                    let _ = remove_tmp(&tmp);
                    Err(e)
                }
            }
        })();

        FileExt::unlock(&lock_file).ok();
        result
    }
}

fn tmp_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn remove_tmp(tmp: &Path) -> std::io::Result<()> {
    if tmp.is_dir() {
        fs::remove_dir_all(tmp)
    } else {
        fs::remove_file(tmp)
    }
}

/// Replaces `target` with `tmp` via a single kernel rename. Works for both
/// files (HNSW/ID-index blobs) and directories (FTS index swap).
pub fn atomic_swap(tmp: &Path, target: &Path) -> Result<()> {
    fs::rename(tmp, target)?;
    Ok(())
}

/// Deletes `*.tmp` files and `*.tmp/` directories under `dir` older than
/// `age_threshold`. Called as the first action under the rebuild lock so a
/// crash mid-build never wedges the next rebuild.
pub fn cleanup_orphaned_temp(dir: &Path, age_threshold: Duration) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let now = SystemTime::now();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(ext) = path.extension() else {
            continue;
        };
        if ext != "tmp" {
            continue;
        }
        let metadata = entry.metadata()?;
        let modified = metadata.modified().unwrap_or(now);
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= age_threshold {
            let _ = remove_tmp(&path);
        }
    }
    Ok(())
}
