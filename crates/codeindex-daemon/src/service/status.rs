//! Combined status RPC handler: `status()` (spec §4.9).
//!
//! Reports cache/storage/watch/indexing state for one collection plus the
//! process-wide ambient counters from [`super::DaemonStats`]. Storage
//! figures are read from on-disk `collection_meta.json` rather than the
//! live cache, since the daemon must be able to report storage state even
//! when nothing is currently cache-resident.

use std::time::Instant;

use codeindex_core::types::{Collection, CollectionKey, CollectionMeta};

use super::DaemonState;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStatus {
    pub loaded: bool,
    pub project: Option<String>,
    pub access_count: u64,
    pub last_accessed_secs_ago: Option<u64>,
    pub ttl_remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStatus {
    pub collection_count: usize,
    pub vector_count: usize,
    pub fts_available: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WatchStatusView {
    pub running: bool,
    pub project: Option<String>,
    pub stats: codeindex_core::watch::WatchStats,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IndexingStatusView {
    pub running: bool,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DaemonCounters {
    pub queries_served: u64,
    pub rebuilds_total: u64,
    pub watch_events_total: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusResponse {
    pub cache: CacheStatus,
    pub storage: StorageStatus,
    pub watch: WatchStatusView,
    pub indexing: IndexingStatusView,
    pub daemon: DaemonCounters,
}

pub fn status(state: &DaemonState, key: &CollectionKey) -> StatusResponse {
    let now = Instant::now();
    let cache = {
        let caches = state.caches.lock();
        match caches.get(key) {
            Some(entry) => CacheStatus {
                loaded: true,
                project: Some(key.project_path.display().to_string()),
                access_count: entry.access_count(),
                last_accessed_secs_ago: Some(
                    now.saturating_duration_since(entry.last_accessed_at()).as_secs(),
                ),
                ttl_remaining_secs: Some(entry.ttl_remaining(now).as_secs()),
            },
            None => CacheStatus::default(),
        }
    };

    let storage = storage_status(key);

    let (watch_running, watch_project, watch_stats) = state.watch.status();
    let watch = WatchStatusView {
        running: watch_running,
        project: watch_project.map(|p| p.display().to_string()),
        stats: watch_stats,
    };

    let indexing = IndexingStatusView {
        running: state.indexing.is_running(),
        project: state
            .indexing
            .running_project()
            .map(|p| p.display().to_string()),
    };

    let daemon = DaemonCounters {
        queries_served: state
            .stats
            .queries_served
            .load(std::sync::atomic::Ordering::Relaxed),
        rebuilds_total: state
            .stats
            .rebuilds_total
            .load(std::sync::atomic::Ordering::Relaxed),
        watch_events_total: state
            .stats
            .watch_events_total
            .load(std::sync::atomic::Ordering::Relaxed),
    };

    StatusResponse {
        cache,
        storage,
        watch,
        indexing,
        daemon,
    }
}

fn storage_status(key: &CollectionKey) -> StorageStatus {
    let index_root = key.project_path.join(".code-indexer").join("index");
    let collection_count = std::fs::read_dir(&index_root)
        .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count())
        .unwrap_or(0);

    let collection = Collection::new(key.collection_dir());
    let meta_path = collection.meta_path();
    let vector_count = std::fs::read(&meta_path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<CollectionMeta>(&bytes).ok())
        .map(|meta| meta.hnsw_index.vector_count)
        .unwrap_or(0);
    let fts_available = collection.tantivy_dir().join("meta.json").exists();

    StorageStatus {
        collection_count,
        vector_count,
        fts_available,
    }
}
