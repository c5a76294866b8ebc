//! Per-project cache entry (C5).
//!
//! Holds the three loaded stores behind a single reader-writer lock. The
//! lock scope is the entire query operation, not merely the lookup: a prior
//! design that released the lock before executing the search exhibited a
//! use-after-free race against concurrent invalidation. Callers must treat
//! [`CacheEntry::read`]/[`CacheEntry::write`] as the operation boundary.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::fts::FtsIndex;
use crate::hnsw::HnswIndex;
use crate::idindex::IdIndex;

pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_EVICTION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// The three loaded stores for one project, guarded by one rw-lock.
struct Loaded {
    hnsw: Option<HnswIndex>,
    id_index: IdIndex,
    fts: Option<FtsIndex>,
    hnsw_version_uuid: String,
    fts_available: bool,
}

/// Timestamps and counters tracked outside the rw-lock so an eviction sweep
/// can snapshot them without blocking a concurrent reader.
struct Bookkeeping {
    created_at: Instant,
    last_accessed_at: RwLock<Instant>,
    access_count: std::sync::atomic::AtomicU64,
}

pub struct CacheEntry {
    pub project_path: PathBuf,
    ttl: Duration,
    bookkeeping: Bookkeeping,
    store: RwLock<Loaded>,
}

impl CacheEntry {
    pub fn new(project_path: PathBuf, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            project_path,
            ttl,
            bookkeeping: Bookkeeping {
                created_at: now,
                last_accessed_at: RwLock::new(now),
                access_count: std::sync::atomic::AtomicU64::new(0),
            },
            store: RwLock::new(Loaded {
                hnsw: None,
                id_index: IdIndex::default(),
                fts: None,
                hnsw_version_uuid: String::new(),
                fts_available: false,
            }),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.bookkeeping.created_at
    }

    pub fn access_count(&self) -> u64 {
        self.bookkeeping
            .access_count
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Snapshot read of the last-access timestamp without taking the main
    /// rw-lock — used by the eviction sweep so it never blocks a query.
    pub fn last_accessed_at(&self) -> Instant {
        *self.bookkeeping.last_accessed_at.read()
    }

    fn touch(&self) {
        *self.bookkeeping.last_accessed_at.write() = Instant::now();
        self.bookkeeping
            .access_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Acquires the read lock, records the access, and invokes `f` with the
    /// loaded stores. The lock is held for the full call.
    pub fn read<R>(
        &self,
        f: impl FnOnce(Option<&HnswIndex>, &IdIndex, Option<&FtsIndex>) -> R,
    ) -> R {
        self.touch();
        let guard = self.store.read();
        f(guard.hnsw.as_ref(), &guard.id_index, guard.fts.as_ref())
    }

    /// Acquires the write lock and invokes `f`, which may replace or clear
    /// store handles (loading, invalidation, incremental mutation).
    pub fn write<R>(
        &self,
        f: impl FnOnce(&mut Option<HnswIndex>, &mut IdIndex, &mut Option<FtsIndex>, &mut String, &mut bool) -> R,
    ) -> R {
        let mut guard = self.store.write();
        let store = &mut *guard;
        f(
            &mut store.hnsw,
            &mut store.id_index,
            &mut store.fts,
            &mut store.hnsw_version_uuid,
            &mut store.fts_available,
        )
    }

    pub fn hnsw_version_uuid(&self) -> String {
        self.store.read().hnsw_version_uuid.clone()
    }

    pub fn fts_available(&self) -> bool {
        self.store.read().fts_available
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_accessed_at()) >= self.ttl
    }

    pub fn ttl_remaining(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.last_accessed_at()))
    }

    /// Reads the on-disk `index_rebuild_uuid` and compares it with the
    /// cached version — disagreement means the cache must be invalidated
    /// and reloaded before the next read.
    pub fn is_stale_against(&self, on_disk_uuid: &str) -> bool {
        self.hnsw_version_uuid() != on_disk_uuid
    }

    /// Drops all store handles so mmap'd file descriptors are released,
    /// then resets version fields. Must be called under the write lock
    /// (enforced here: this method itself takes it).
    pub fn invalidate(&self) {
        let mut guard = self.store.write();
        guard.hnsw = None;
        guard.id_index = IdIndex::default();
        guard.fts = None;
        guard.hnsw_version_uuid.clear();
        guard.fts_available = false;
    }
}
