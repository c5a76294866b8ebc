//! Integration scenarios that exercise `DaemonService` the way the actual
//! RPC surface and a second, independent daemon-like process would use it
//! (spec §8's S1-S3). Unit tests under `src/` already cover individual
//! components in isolation; these drive the whole service across threads.

use std::path::Path;
use std::sync::Arc;

use codeindex_core::collaborators::{Chunk, Chunker, EmbeddingProvider};
use codeindex_core::error::Result as IndexResult;
use codeindex_core::hnsw::{HnswStore, LoadResult};
use codeindex_core::indexing::ProgressCallback;
use codeindex_core::types::{Collection, CollectionKey, CollectionMeta};

use codeindex_daemon::config::DaemonConfig;
use codeindex_daemon::service::{DaemonService, IndexParams, QueryFilters};

struct ZeroEmbedder;
impl EmbeddingProvider for ZeroEmbedder {
    fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
    }
    fn dimensions(&self) -> usize {
        4
    }
}

struct OneChunkPerFile;
impl Chunker for OneChunkPerFile {
    fn chunk(&self, _path: &Path, content: &str) -> IndexResult<Vec<Chunk>> {
        Ok(vec![Chunk {
            text: content.to_string(),
            line_start: 1,
            line_end: content.lines().count().max(1) as u32,
            language: "rust".to_string(),
        }])
    }
}

fn noop_progress() -> ProgressCallback {
    Arc::new(|_, _, _, _, _| {})
}

fn read_meta(collection: &Collection) -> CollectionMeta {
    let path = collection.meta_path();
    if !path.exists() {
        return CollectionMeta::default();
    }
    let bytes = std::fs::read(&path).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// S1: the second query against an already-warm collection reuses the same
/// `CacheEntry` instead of re-creating it, and its access counter advances.
#[test]
fn second_query_reuses_the_warm_cache_entry() {
    let dir = tempfile::tempdir().unwrap();
    let key = CollectionKey::new(dir.path(), "default");
    let service = DaemonService::new(DaemonConfig::default());
    let embedder = ZeroEmbedder;

    service
        .query(&key, "hello", 5, &QueryFilters::default(), &embedder)
        .unwrap();
    let entry_after_first = service.state.ensure_cache_loaded(&key);
    let count_after_first = entry_after_first.access_count();

    service
        .query(&key, "hello", 5, &QueryFilters::default(), &embedder)
        .unwrap();
    let entry_after_second = service.state.ensure_cache_loaded(&key);

    assert!(Arc::ptr_eq(&entry_after_first, &entry_after_second));
    assert!(entry_after_second.access_count() > count_after_first);
    assert_eq!(service.state.caches.lock().len(), 1);
}

/// S2: ten concurrent queries against a collection that is being indexed at
/// the same time all complete without deadlocking or erroring out.
#[test]
fn ten_concurrent_queries_survive_a_live_indexing_run() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.rs");
    std::fs::write(&file, "fn main() {}\nfn helper() {}\n").unwrap();
    let key = CollectionKey::new(dir.path(), "default");
    let service = Arc::new(DaemonService::new(DaemonConfig::default()));

    let indexer = {
        let service = service.clone();
        let key = key.clone();
        std::thread::spawn(move || {
            service.index(
                &key,
                IndexParams {
                    skip_hnsw_rebuild: false,
                    files: vec![file],
                },
                noop_progress(),
                &OneChunkPerFile,
                &ZeroEmbedder,
            )
        })
    };

    let queriers: Vec<_> = (0..10)
        .map(|i| {
            let service = service.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                service.query(&key, &format!("query {i}"), 5, &QueryFilters::default(), &ZeroEmbedder)
            })
        })
        .collect();

    assert!(indexer.join().unwrap().is_ok());
    for q in queriers {
        assert!(q.join().unwrap().is_ok());
    }
}

/// S3: two independent `DaemonService`s (standing in for two daemon
/// processes, each with its own in-memory single-flight state) racing to
/// rebuild the same on-disk collection must still leave the index in a
/// fully-written, loadable state — the `AtomicRebuilder` flock, not
/// in-process locking, is what has to serialize them.
#[test]
fn two_independent_daemons_serialize_rebuilds_via_the_flock() {
    let dir = tempfile::tempdir().unwrap();
    let file_a = dir.path().join("a.rs");
    let file_b = dir.path().join("b.rs");
    std::fs::write(&file_a, "fn a() {}\n").unwrap();
    std::fs::write(&file_b, "fn b() {}\n").unwrap();
    let key = CollectionKey::new(dir.path(), "default");

    let service_a = Arc::new(DaemonService::new(DaemonConfig::default()));
    let service_b = Arc::new(DaemonService::new(DaemonConfig::default()));

    let handle_a = {
        let service_a = service_a.clone();
        let key = key.clone();
        std::thread::spawn(move || {
            service_a.index(
                &key,
                IndexParams {
                    skip_hnsw_rebuild: false,
                    files: vec![file_a],
                },
                noop_progress(),
                &OneChunkPerFile,
                &ZeroEmbedder,
            )
        })
    };
    let handle_b = {
        let service_b = service_b.clone();
        let key = key.clone();
        std::thread::spawn(move || {
            service_b.index(
                &key,
                IndexParams {
                    skip_hnsw_rebuild: false,
                    files: vec![file_b],
                },
                noop_progress(),
                &OneChunkPerFile,
                &ZeroEmbedder,
            )
        })
    };

    assert!(handle_a.join().unwrap().is_ok());
    assert!(handle_b.join().unwrap().is_ok());

    let collection = Collection::new(key.collection_dir());
    let meta = read_meta(&collection);
    let loaded = HnswStore::load(&collection, &meta).unwrap();
    assert!(matches!(loaded, LoadResult::Loaded { .. }));
}
