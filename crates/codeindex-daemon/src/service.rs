//! RPC surface (C9). Split into per-operation handler modules per spec
//! §9's file-size guidance: [`query`] (read path), [`mutate`] (write path),
//! [`watch`] (watch lifecycle), [`status`] (combined status payload).
//!
//! Lock order is global: `cache_lock -> indexing_lock`. Never reversed.
//! `watch_lock` is the cache write lock — watch state is logically part of
//! the cache-entry-aware state, so no separate lock is introduced.

mod mutate;
mod query;
mod status;
mod watch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use codeindex_core::cache::CacheEntry;
use codeindex_core::collaborators::EmbeddingProvider;
use codeindex_core::eviction::{EvictionConfig, EvictionSink, EvictionThread};
use codeindex_core::indexing::IndexingCoordinator;
use codeindex_core::types::CollectionKey;
use codeindex_core::watch::{WatchCoordinator, WatchDeps};

use crate::config::DaemonConfig;

pub use mutate::{CleanParams, IndexParams};
pub use query::{HybridResult, QueryFilters, QueryResponse};
pub use status::StatusResponse;

/// Process-wide counters surfaced through `status()` under a `daemon` key
/// (ambient observability, not part of the distilled RPC surface).
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub queries_served: std::sync::atomic::AtomicU64,
    pub rebuilds_total: std::sync::atomic::AtomicU64,
    pub watch_events_total: std::sync::atomic::AtomicU64,
}

/// Forwards `EvictionThread` events: eviction itself only needs logging,
/// but an idle-shutdown request has to reach the server, which owns the
/// listener loop this state struct does not. Setting `shutdown_requested`
/// lets the server's own shutdown-watcher thread notice without the
/// eviction thread needing a reference back into `Server`.
struct StateEvictionSink {
    shutdown_requested: Arc<AtomicBool>,
}

impl EvictionSink for StateEvictionSink {
    fn on_evicted(&self, project_path: &Path) {
        tracing::debug!(project = %project_path.display(), "evicted idle cache entry");
    }

    fn on_idle_shutdown_requested(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }
}

/// Shared state handed to every connection handler via `Arc`. No
/// process-globals: this replaces the module-level global service instance
/// pattern the original relied on for its RPC framework's sharing
/// semantics.
pub struct DaemonState {
    pub config: DaemonConfig,
    pub caches: Mutex<HashMap<CollectionKey, Arc<CacheEntry>>>,
    evictions: Mutex<HashMap<CollectionKey, EvictionThread>>,
    pub indexing: IndexingCoordinator,
    pub watch: WatchCoordinator,
    pub watch_deps: Mutex<Option<Arc<WatchDeps>>>,
    pub stats: DaemonStats,
    pub shutdown_requested: Arc<AtomicBool>,
}

impl DaemonState {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            caches: Mutex::new(HashMap::new()),
            evictions: Mutex::new(HashMap::new()),
            indexing: IndexingCoordinator::new(),
            watch: WatchCoordinator::new(),
            watch_deps: Mutex::new(None),
            stats: DaemonStats::default(),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Loads the cache entry for `key` on demand, creating it if absent and
    /// spawning its dedicated `EvictionThread` (one per collection, since
    /// the TTL clock and access counters are per `CacheEntry`, not global).
    pub fn ensure_cache_loaded(&self, key: &CollectionKey) -> Arc<CacheEntry> {
        let mut caches = self.caches.lock();
        if let Some(entry) = caches.get(key) {
            return entry.clone();
        }

        let entry = Arc::new(CacheEntry::new(key.project_path.clone(), self.config.ttl()));
        caches.insert(key.clone(), entry.clone());
        drop(caches);

        let sink = Arc::new(StateEvictionSink {
            shutdown_requested: self.shutdown_requested.clone(),
        });
        let eviction = EvictionThread::spawn(
            Arc::downgrade(&entry),
            self.watch.running_flag(),
            sink,
            EvictionConfig {
                check_interval: self.config.eviction_check_interval(),
                auto_shutdown_on_idle: self.config.auto_shutdown_on_idle,
            },
        );
        self.evictions.lock().insert(key.clone(), eviction);

        entry
    }

    pub fn clear_cache(&self) {
        let caches = self.caches.lock();
        for entry in caches.values() {
            entry.invalidate();
        }
    }

    pub fn clear_cache_for(&self, key: &CollectionKey) {
        if let Some(entry) = self.caches.lock().get(key) {
            entry.invalidate();
        }
    }

    /// Stops every per-collection eviction thread. Called on full daemon
    /// shutdown so no background thread outlives the process cleanup path.
    pub fn stop_all_evictions(&self) {
        let mut evictions = self.evictions.lock();
        for (_, thread) in evictions.drain() {
            thread.stop();
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

/// The RPC surface itself; a thin dispatcher over `DaemonState` and the
/// per-operation handler modules.
pub struct DaemonService {
    pub state: Arc<DaemonState>,
}

impl DaemonService {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            state: Arc::new(DaemonState::new(config)),
        }
    }

    pub fn query(
        &self,
        key: &CollectionKey,
        query_text: &str,
        limit: usize,
        filters: &query::QueryFilters,
        embedder: &dyn EmbeddingProvider,
    ) -> crate::Result<query::QueryResponse> {
        self.state
            .stats
            .queries_served
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        query::query(&self.state, key, query_text, limit, filters, embedder)
    }

    pub fn query_fts(
        &self,
        key: &CollectionKey,
        query_text: &str,
        opts: &codeindex_core::fts::FtsSearchOptions,
    ) -> crate::Result<Vec<codeindex_core::types::FtsResult>> {
        query::query_fts(&self.state, key, query_text, opts)
    }

    pub fn query_hybrid(
        &self,
        key: &CollectionKey,
        query_text: &str,
        limit: usize,
        embedder: &dyn EmbeddingProvider,
    ) -> crate::Result<Vec<query::HybridResult>> {
        query::query_hybrid(&self.state, key, query_text, limit, embedder)
    }

    pub fn query_temporal(
        &self,
        key: &CollectionKey,
        query_text: &str,
        time_range: &str,
        limit: usize,
        embedder: &dyn EmbeddingProvider,
    ) -> crate::Result<query::QueryResponse> {
        query::query_temporal(&self.state, key, query_text, time_range, limit, embedder)
    }

    pub fn index(
        &self,
        key: &CollectionKey,
        params: mutate::IndexParams,
        progress: codeindex_core::indexing::ProgressCallback,
        chunker: &dyn codeindex_core::collaborators::Chunker,
        embedder: &dyn EmbeddingProvider,
    ) -> crate::Result<codeindex_core::indexing::IndexingStats> {
        mutate::index(&self.state, key, params, progress, chunker, embedder)
    }

    pub fn clean(&self, key: &CollectionKey, params: mutate::CleanParams) -> crate::Result<()> {
        mutate::clean(&self.state, key, params)
    }

    pub fn clean_data(&self, key: &CollectionKey) -> crate::Result<()> {
        mutate::clean_data(&self.state, key)
    }

    pub fn watch_start(&self, root: PathBuf, key: &CollectionKey) -> crate::Result<()> {
        watch::watch_start(&self.state, root, key)
    }

    pub fn watch_stop(&self) -> codeindex_core::watch::WatchStats {
        watch::watch_stop(&self.state)
    }

    pub fn watch_status(&self) -> (bool, Option<PathBuf>, codeindex_core::watch::WatchStats) {
        self.state.watch.status()
    }

    pub fn status(&self, key: &CollectionKey) -> status::StatusResponse {
        status::status(&self.state, key)
    }

    pub fn clear_cache(&self) {
        self.state.clear_cache();
    }

    /// Stops watch, invalidates the cache, and returns — the caller (the
    /// server) is responsible for the normal process-termination path so
    /// finally-blocks (socket unlink) run; this never calls `exit()`
    /// directly.
    pub fn shutdown(&self) {
        self.state.watch.stop();
        self.state.clear_cache();
        self.state.stop_all_evictions();
    }
}
