//! Filesystem watcher driving incremental store updates (C8).
//!
//! Only one watch may exist per daemon. Does not depend on an active
//! indexing session — a prior design coupling the two was a bug. On every
//! file event the chunk -> embed -> mutate pipeline runs under the cache
//! write lock so concurrent queries observe a consistent before/after
//! snapshot. The notify-event-to-store-mutation pipeline here mirrors
//! `filesystem::index::watcher`'s `create_index_watcher`/
//! `apply_notify_event` shape, adapted to mutate the three index stores
//! instead of a path tree.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::cache::CacheEntry;
use crate::collaborators::{Chunker, EmbeddingProvider, GitTopology};
use crate::error::{IndexError, Result};
use crate::fts::FtsDocument;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct WatchStats {
    pub events_processed: u64,
    pub files_added: u64,
    pub files_updated: u64,
    pub files_removed: u64,
    pub errors: u64,
}

struct StatsInner {
    events_processed: AtomicU64,
    files_added: AtomicU64,
    files_updated: AtomicU64,
    files_removed: AtomicU64,
    errors: AtomicU64,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            events_processed: AtomicU64::new(0),
            files_added: AtomicU64::new(0),
            files_updated: AtomicU64::new(0),
            files_removed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}

impl StatsInner {
    fn snapshot(&self) -> WatchStats {
        WatchStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            files_added: self.files_added.load(Ordering::Relaxed),
            files_updated: self.files_updated.load(Ordering::Relaxed),
            files_removed: self.files_removed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators the watch pipeline needs on every file event.
pub struct WatchDeps {
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub git: Arc<dyn GitTopology>,
}

/// Single-watch-per-daemon coordinator.
pub struct WatchCoordinator {
    running: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    project: Mutex<Option<PathBuf>>,
}

impl Default for WatchCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchCoordinator {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsInner::default()),
            watcher: Mutex::new(None),
            project: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Shared flag mirroring `is_running()`, handed to `EvictionThread` so
    /// it can skip idle-shutdown while a watch is active without taking a
    /// lock or holding a reference back into this coordinator.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn status(&self) -> (bool, Option<PathBuf>, WatchStats) {
        (
            self.is_running(),
            self.project.lock().unwrap().clone(),
            self.stats.snapshot(),
        )
    }

    /// Starts watching `root`. Every event mutates `cache` under its write
    /// lock via `apply_event`. Fails with `AlreadyRunning` if a watch is
    /// already active on this daemon.
    pub fn start(
        &self,
        root: PathBuf,
        cache: Arc<CacheEntry>,
        deps: Arc<WatchDeps>,
    ) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IndexError::AlreadyRunning("watch"));
        }

        let stats = self.stats.clone();
        let watch_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            };
            apply_notify_event(&event, &watch_root, &cache, &deps, &stats);
        })
        .map_err(|e| IndexError::ExternalFailure(format!("watcher init failed: {e}")))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| IndexError::ExternalFailure(format!("watch failed: {e}")))?;

        *self.watcher.lock().unwrap() = Some(watcher);
        *self.project.lock().unwrap() = Some(root);
        Ok(())
    }

    /// Handles a branch/commit change notification by delegating to the
    /// injected [`GitTopology`] and re-indexing the changed files through
    /// the same upsert pipeline notify events use.
    pub fn on_branch_change(
        &self,
        root: &Path,
        cache: &Arc<CacheEntry>,
        deps: &Arc<WatchDeps>,
        old_branch: &str,
        new_branch: &str,
        old_commit: Option<&str>,
        new_commit: Option<&str>,
    ) -> Result<usize> {
        let change = deps
            .git
            .analyze_branch_change(old_branch, new_branch, old_commit, new_commit)?;
        let mut touched = 0;
        for rel in &change.changed_files {
            let abs = root.join(rel);
            if abs.exists() {
                upsert_path(&abs, root, cache, deps)?;
            } else {
                remove_path(&abs, root, cache)?;
            }
            touched += 1;
        }
        Ok(touched)
    }

    /// Signals cancellation, drops the watcher, joins implicitly (notify's
    /// watcher thread is torn down on drop), and clears state. The spec's
    /// 5s join timeout is notify's own internal teardown budget; there is
    /// no separate join handle to manage here since notify owns its thread.
    pub fn stop(&self) -> WatchStats {
        let snapshot = self.stats.snapshot();
        *self.watcher.lock().unwrap() = None;
        *self.project.lock().unwrap() = None;
        self.running.store(false, Ordering::SeqCst);
        snapshot
    }
}

fn apply_notify_event(
    event: &Event,
    root: &Path,
    cache: &Arc<CacheEntry>,
    deps: &Arc<WatchDeps>,
    stats: &Arc<StatsInner>,
) {
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }
    stats.events_processed.fetch_add(1, Ordering::Relaxed);

    for path in &event.paths {
        let result = if path.exists() {
            upsert_path(path, root, cache, deps)
        } else {
            remove_path(path, root, cache)
        };
        match result {
            Ok(Outcome::Added) => {
                stats.files_added.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Outcome::Updated) => {
                stats.files_updated.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Outcome::Removed) => {
                stats.files_removed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Outcome::Skipped) => {}
            Err(_) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

enum Outcome {
    Added,
    Updated,
    Removed,
    Skipped,
}

fn upsert_path(
    path: &Path,
    root: &Path,
    cache: &Arc<CacheEntry>,
    deps: &Arc<WatchDeps>,
) -> Result<Outcome> {
    if !path.is_file() {
        return Ok(Outcome::Skipped);
    }
    let Ok(content) = std::fs::read_to_string(path) else {
        return Ok(Outcome::Skipped);
    };
    let rel = path.strip_prefix(root).unwrap_or(path);
    let chunks = deps.chunker.chunk(path, &content)?;
    if chunks.is_empty() {
        return Ok(Outcome::Skipped);
    }
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = deps.embedder.embed(&texts)?;

    let mut was_update = false;
    cache.write(|hnsw, id_index, fts, _uuid, _fts_available| {
        for (i, (chunk, vector)) in chunks.iter().zip(vectors.iter()).enumerate() {
            let point_id = format!("{}:{}", rel.display(), i);
            if id_index.get(&point_id).is_some() {
                was_update = true;
            }
            id_index.insert(point_id.clone(), rel.display().to_string());
            if let Some(index) = hnsw.as_mut() {
                index.add_or_update_vector(&point_id, vector);
            }
            if let Some(fts_index) = fts.as_mut() {
                let _ = fts_index.incremental_update(&FtsDocument {
                    path: rel.display().to_string(),
                    line: chunk.line_start,
                    column: 0,
                    language: chunk.language.clone(),
                    body: chunk.text.clone(),
                });
            }
        }
    });

    Ok(if was_update {
        Outcome::Updated
    } else {
        Outcome::Added
    })
}

fn remove_path(path: &Path, root: &Path, cache: &Arc<CacheEntry>) -> Result<Outcome> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel_str = rel.display().to_string();
    cache.write(|hnsw, id_index, fts, _uuid, _fts_available| {
        let stale_ids: Vec<String> = id_index
            .iter()
            .filter(|(_, p)| *p == rel_str)
            .map(|(id, _)| id.to_string())
            .collect();
        for point_id in &stale_ids {
            id_index.remove(point_id);
            if let Some(index) = hnsw.as_mut() {
                index.remove_vector(point_id);
            }
        }
        if let Some(fts_index) = fts.as_mut() {
            let _ = fts_index.incremental_delete(&rel_str);
        }
    });
    Ok(Outcome::Removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{BranchChange, Chunk};
    use std::time::Duration;

    struct LineChunker;
    impl Chunker for LineChunker {
        fn chunk(&self, _path: &Path, content: &str) -> Result<Vec<Chunk>> {
            Ok(content
                .lines()
                .enumerate()
                .map(|(i, line)| Chunk {
                    text: line.to_string(),
                    line_start: i as u32 + 1,
                    line_end: i as u32 + 1,
                    language: "text".to_string(),
                })
                .collect())
        }
    }

    struct ZeroEmbedder;
    impl EmbeddingProvider for ZeroEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    struct NoopGit;
    impl GitTopology for NoopGit {
        fn analyze_branch_change(
            &self,
            _old_branch: &str,
            _new_branch: &str,
            _old_commit: Option<&str>,
            _new_commit: Option<&str>,
        ) -> Result<BranchChange> {
            Ok(BranchChange::default())
        }
    }

    #[test]
    fn start_twice_fails_with_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = WatchCoordinator::new();
        let cache = Arc::new(CacheEntry::new(dir.path().to_path_buf(), Duration::from_secs(60)));
        let deps = Arc::new(WatchDeps {
            chunker: Arc::new(LineChunker),
            embedder: Arc::new(ZeroEmbedder),
            git: Arc::new(NoopGit),
        });

        coordinator
            .start(dir.path().to_path_buf(), cache.clone(), deps.clone())
            .unwrap();
        let second = coordinator.start(dir.path().to_path_buf(), cache, deps);
        assert!(matches!(second, Err(IndexError::AlreadyRunning("watch"))));
        coordinator.stop();
    }

    #[test]
    fn upsert_path_adds_new_point_to_id_index() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("new.py");
        std::fs::write(&file, "unique_token_from_new_py\n").unwrap();

        let cache = Arc::new(CacheEntry::new(dir.path().to_path_buf(), Duration::from_secs(60)));
        let deps = Arc::new(WatchDeps {
            chunker: Arc::new(LineChunker),
            embedder: Arc::new(ZeroEmbedder),
            git: Arc::new(NoopGit),
        });

        upsert_path(&file, dir.path(), &cache, &deps).unwrap();

        let found = cache.read(|_, id_index, _| id_index.get("new.py:0").is_some());
        assert!(found);
    }
}
