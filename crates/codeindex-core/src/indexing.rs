//! Single-flight background indexing (C7).
//!
//! At most one indexing job runs per process. The `Idle -> Running`
//! transition and the cache invalidation that accompanies it are a single
//! critical section under both the cache write lock and the coordinator's
//! own lock — splitting them was a TOCTOU bug in an earlier revision, so
//! [`IndexingCoordinator::start_index`] takes the cache-invalidate closure
//! as a parameter and runs it inside the same lock acquisition.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancel::{CancellationSource, CancellationToken};
use crate::error::{IndexError, Result};
use crate::hnsw::{HnswIndex, HnswStore};
use crate::idindex::IdIndexStore;
use crate::types::{Collection, CollectionMeta, FileStatus};

/// Per-session record of point-id mutations, consulted at session end to
/// decide incremental vs full HNSW rebuild.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    pub added: HashSet<String>,
    pub updated: HashSet<String>,
    pub deleted: HashSet<String>,
}

impl ChangeTracker {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Records an upsert, classified by whether `point_id` was already
    /// present in the ID index at session start.
    pub fn note_upsert(&mut self, point_id: &str, pre_existing: bool) {
        if pre_existing {
            self.updated.insert(point_id.to_string());
        } else {
            self.added.insert(point_id.to_string());
        }
    }

    pub fn note_delete(&mut self, point_id: &str) {
        self.added.remove(point_id);
        self.updated.remove(point_id);
        self.deleted.insert(point_id.to_string());
    }
}

/// Which rebuild path `end_indexing` took; uniquely determined by
/// `(has_existing_index, change_tracker_nonempty, skip_hnsw_rebuild)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HnswUpdateKind {
    Full,
    Incremental,
    Skipped,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexingStats {
    pub files_processed: usize,
    pub chunks_created: usize,
    pub failed_files: usize,
    pub duration_seconds: f64,
    pub cancelled: bool,
    pub hnsw_update: HnswUpdateKind,
}

pub type ProgressCallback = Arc<
    dyn Fn(usize, usize, &str, &str, Option<&[FileStatus]>) + Send + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Running { project: PathBuf },
}

struct Session {
    tracker: ChangeTracker,
    cancel: CancellationSource,
}

/// Manages at most one background indexing job for the process.
pub struct IndexingCoordinator {
    state: Mutex<State>,
    session: Mutex<Option<Session>>,
}

impl Default for IndexingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexingCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Idle),
            session: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running { .. })
    }

    pub fn running_project(&self) -> Option<PathBuf> {
        match &*self.state.lock() {
            State::Running { project } => Some(project.clone()),
            State::Idle => None,
        }
    }

    /// `Idle -> Running` under a single critical section that also runs
    /// `invalidate_cache`. Fails with `AlreadyRunning` if a job is already
    /// in flight; does not call `invalidate_cache` in that case.
    pub fn start_index(
        &self,
        project: PathBuf,
        invalidate_cache: impl FnOnce(),
    ) -> Result<CancellationToken> {
        let mut state = self.state.lock();
        if matches!(*state, State::Running { .. }) {
            return Err(IndexError::AlreadyRunning("indexing"));
        }
        invalidate_cache();
        *state = State::Running {
            project: project.clone(),
        };
        drop(state);

        let cancel = CancellationSource::new();
        let token = cancel.token();
        *self.session.lock() = Some(Session {
            tracker: ChangeTracker::default(),
            cancel,
        });
        Ok(token)
    }

    pub fn cancel(&self) {
        if let Some(session) = self.session.lock().as_ref() {
            session.cancel.cancel();
        }
    }

    pub fn note_upsert(&self, point_id: &str, pre_existing: bool) {
        if let Some(session) = self.session.lock().as_mut() {
            session.tracker.note_upsert(point_id, pre_existing);
        }
    }

    pub fn note_delete(&self, point_id: &str) {
        if let Some(session) = self.session.lock().as_mut() {
            session.tracker.note_delete(point_id);
        }
    }

    /// Applies the end-of-session HNSW update decision (spec §4.7) and
    /// transitions back to `Idle`. `load_vector` resolves a point_id's
    /// vector from the ID index for incremental application; `all_vectors`
    /// supplies every currently-indexed vector for a full rebuild.
    pub fn end_indexing(
        &self,
        collection: &Collection,
        meta: &mut CollectionMeta,
        mut index: Option<HnswIndex>,
        skip_hnsw: bool,
        all_vectors: impl FnOnce() -> Vec<(String, Vec<f32>)>,
        load_vector: impl Fn(&str) -> Option<Vec<f32>>,
        invalidate_cache: impl FnOnce(),
    ) -> Result<HnswUpdateKind> {
        let session = self.session.lock().take();
        let tracker = session.map(|s| s.tracker).unwrap_or_default();

        let has_existing_index = index.is_some();
        let update_kind = if skip_hnsw || tracker.is_empty() {
            HnswUpdateKind::Skipped
        } else if !has_existing_index {
            let vectors = all_vectors();
            HnswStore::rebuild_from_vectors(collection, &vectors, meta)?;
            HnswUpdateKind::Full
        } else {
            let idx = index.as_mut().expect("checked above");
            for point_id in tracker.added.iter().chain(tracker.updated.iter()) {
                if let Some(vector) = load_vector(point_id) {
                    idx.add_or_update_vector(point_id, &vector);
                }
            }
            for point_id in &tracker.deleted {
                idx.remove_vector(point_id);
            }
            HnswStore::save_incremental_update(collection, idx, meta)?;
            HnswUpdateKind::Incremental
        };

        invalidate_cache();
        *self.state.lock() = State::Idle;
        Ok(update_kind)
    }

    /// Per-file failure policy: failures are counted, not propagated,
    /// unless no file in the session succeeded.
    pub fn finalize_failure_policy(files_processed: usize, failed_files: usize) -> Result<()> {
        if files_processed == 0 && failed_files > 0 {
            return Err(IndexError::Fatal(
                "indexing session failed: no files succeeded".into(),
            ));
        }
        Ok(())
    }
}

/// Writes the IdIndex back to disk if the session touched it; called by
/// callers that maintain an in-memory IdIndex during the session.
pub fn flush_id_index_if_dirty(
    collection: &Collection,
    id_index: &crate::idindex::IdIndex,
    dirty: bool,
) -> Result<()> {
    if dirty {
        IdIndexStore::save(collection, id_index)?;
    }
    Ok(())
}

pub fn poll_cancellation(token: &CancellationToken, counter: usize) -> Result<()> {
    token
        .is_cancelled_sparse(counter)
        .ok_or(IndexError::Cancelled)
}

/// Convenience wrapper matching the spec's `start_index` / duplicate-call
/// idempotence law: calling twice back-to-back returns `AlreadyRunning`
/// iff the first is still running.
pub fn try_start_twice(coordinator: &IndexingCoordinator, project: PathBuf) -> (bool, bool) {
    let first = coordinator.start_index(project.clone(), || {}).is_ok();
    let second = coordinator.start_index(project, || {}).is_ok();
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_index_twice_second_call_fails_while_running() {
        let coordinator = IndexingCoordinator::new();
        let (first, second) = try_start_twice(&coordinator, PathBuf::from("/tmp/p"));
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn change_tracker_classifies_upsert_by_pre_existing_flag() {
        let mut tracker = ChangeTracker::default();
        tracker.note_upsert("a", false);
        tracker.note_upsert("b", true);
        assert!(tracker.added.contains("a"));
        assert!(tracker.updated.contains("b"));
    }

    #[test]
    fn delete_removes_from_added_and_updated() {
        let mut tracker = ChangeTracker::default();
        tracker.note_upsert("a", false);
        tracker.note_delete("a");
        assert!(!tracker.added.contains("a"));
        assert!(tracker.deleted.contains("a"));
    }

    #[test]
    fn end_indexing_with_no_changes_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        let coordinator = IndexingCoordinator::new();
        coordinator
            .start_index(PathBuf::from("/tmp/p"), || {})
            .unwrap();

        let mut meta = CollectionMeta::default();
        let kind = coordinator
            .end_indexing(
                &collection,
                &mut meta,
                None,
                false,
                Vec::new,
                |_| None,
                || {},
            )
            .unwrap();

        assert_eq!(kind, HnswUpdateKind::Skipped);
        assert!(!coordinator.is_running());
    }

    #[test]
    fn end_indexing_with_changes_and_no_existing_index_does_full_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        let coordinator = IndexingCoordinator::new();
        coordinator
            .start_index(PathBuf::from("/tmp/p"), || {})
            .unwrap();
        coordinator.note_upsert("pt1", false);

        let mut meta = CollectionMeta::default();
        let kind = coordinator
            .end_indexing(
                &collection,
                &mut meta,
                None,
                false,
                || vec![("pt1".to_string(), vec![0.1, 0.2, 0.3])],
                |_| None,
                || {},
            )
            .unwrap();

        assert_eq!(kind, HnswUpdateKind::Full);
    }

    #[test]
    fn finalize_failure_policy_errors_only_when_nothing_succeeded() {
        assert!(IndexingCoordinator::finalize_failure_policy(5, 2).is_ok());
        assert!(IndexingCoordinator::finalize_failure_policy(0, 3).is_err());
        assert!(IndexingCoordinator::finalize_failure_policy(0, 0).is_ok());
    }
}
