//! Write-path RPC handlers: `index`, `clean`, `clean_data`.
//!
//! Cache invalidation always precedes mutation — this ordering is
//! non-negotiable per spec §4.9.

use std::path::PathBuf;

use codeindex_core::collaborators::{Chunker, EmbeddingProvider};
use codeindex_core::hnsw::{HnswStore, LoadResult};
use codeindex_core::idindex::IdIndexStore;
use codeindex_core::indexing::{IndexingStats, ProgressCallback};
use codeindex_core::types::{Collection, CollectionKey, CollectionMeta};
use codeindex_core::vectors::VectorStore;

use super::DaemonState;
use crate::error::DaemonError;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IndexParams {
    pub skip_hnsw_rebuild: bool,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CleanParams {
    pub point_ids: Vec<String>,
}

/// Blocks until the indexing job finishes, streaming progress through
/// `progress`. On entry: under the write lock, check single-flight,
/// invalidate cache, spawn the session. On exit: invalidate again
/// (post-build) and clear worker state — both handled by
/// `IndexingCoordinator::{start_index,end_indexing}`.
pub fn index(
    state: &DaemonState,
    key: &CollectionKey,
    params: IndexParams,
    progress: ProgressCallback,
    chunker: &dyn Chunker,
    embedder: &dyn EmbeddingProvider,
) -> crate::Result<IndexingStats> {
    let entry = state.ensure_cache_loaded(key);
    let token = state
        .indexing
        .start_index(key.project_path.clone(), || entry.invalidate())
        .map_err(DaemonError::Index)?;

    let collection = Collection::new(key.collection_dir());
    let mut meta = load_or_default_meta(&collection)?;
    let mut id_index = IdIndexStore::load(&collection).map_err(DaemonError::Index)?;
    let mut vector_table = VectorStore::load(&collection).map_err(DaemonError::Index)?;

    let start = std::time::Instant::now();
    let mut files_processed = 0usize;
    let mut chunks_created = 0usize;
    let mut failed_files = 0usize;
    let mut cancelled = false;

    for (i, path) in params.files.iter().enumerate() {
        if token.is_cancelled_sparse(i).is_none() {
            cancelled = true;
            break;
        }
        progress(i, params.files.len(), &path.display().to_string(), "indexing", None);

        match std::fs::read_to_string(path) {
            Ok(content) => match chunker.chunk(path, &content) {
                Ok(chunks) => {
                    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
                    match embedder.embed(&texts) {
                        Ok(vectors) => {
                            for (j, (_chunk, vector)) in chunks.iter().zip(vectors.into_iter()).enumerate() {
                                let point_id = format!("{}:{}", path.display(), j);
                                let pre_existing = id_index.get(&point_id).is_some();
                                id_index.insert(point_id.clone(), path.display().to_string());
                                vector_table.insert(point_id.clone(), vector);
                                state.indexing.note_upsert(&point_id, pre_existing);
                            }
                            chunks_created += chunks.len();
                            files_processed += 1;
                        }
                        Err(_) => failed_files += 1,
                    }
                }
                Err(_) => failed_files += 1,
            },
            Err(_) => failed_files += 1,
        }
    }

    codeindex_core::indexing::IndexingCoordinator::finalize_failure_policy(
        files_processed,
        failed_files,
    )
    .map_err(DaemonError::Index)?;

    IdIndexStore::save(&collection, &id_index).map_err(DaemonError::Index)?;

    let existing_index = match HnswStore::load(&collection, &meta).map_err(DaemonError::Index)? {
        LoadResult::Loaded { index, .. } => Some(index),
        LoadResult::NoIndex => None,
    };

    let hnsw_update = state
        .indexing
        .end_indexing(
            &collection,
            &mut meta,
            existing_index,
            params.skip_hnsw_rebuild,
            || {
                vector_table
                    .iter()
                    .map(|(id, vector)| (id.to_string(), vector.to_vec()))
                    .collect()
            },
            |point_id| vector_table.get(point_id).map(|v| v.to_vec()),
            || entry.invalidate(),
        )
        .map_err(DaemonError::Index)?;

    VectorStore::save(&collection, &vector_table).map_err(DaemonError::Index)?;
    save_meta(&collection, &meta)?;

    Ok(IndexingStats {
        files_processed,
        chunks_created,
        failed_files,
        duration_seconds: start.elapsed().as_secs_f64(),
        cancelled,
        hnsw_update,
    })
}

/// Invalidates the cache, then deletes the named vectors. Order is
/// non-negotiable: cache invalidation BEFORE mutation.
pub fn clean(state: &DaemonState, key: &CollectionKey, params: CleanParams) -> crate::Result<()> {
    let entry = state.ensure_cache_loaded(key);
    entry.invalidate();

    let collection = Collection::new(key.collection_dir());
    let mut id_index = IdIndexStore::load(&collection).map_err(DaemonError::Index)?;
    let mut vector_table = VectorStore::load(&collection).map_err(DaemonError::Index)?;
    for point_id in &params.point_ids {
        id_index.remove(point_id);
        vector_table.remove(point_id);
    }
    IdIndexStore::save(&collection, &id_index).map_err(DaemonError::Index)?;
    VectorStore::save(&collection, &vector_table).map_err(DaemonError::Index)?;
    Ok(())
}

/// Invalidates the cache, then deletes the entire collection directory.
pub fn clean_data(state: &DaemonState, key: &CollectionKey) -> crate::Result<()> {
    let entry = state.ensure_cache_loaded(key);
    entry.invalidate();

    let dir = key.collection_dir();
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

fn load_or_default_meta(collection: &Collection) -> crate::Result<CollectionMeta> {
    let path = collection.meta_path();
    if !path.exists() {
        return Ok(CollectionMeta::default());
    }
    let bytes = std::fs::read(&path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DaemonError::Index(codeindex_core::error::IndexError::Serialization(e.to_string())))
}

fn save_meta(collection: &Collection, meta: &CollectionMeta) -> crate::Result<()> {
    std::fs::create_dir_all(&collection.root)?;
    let bytes = serde_json::to_vec_pretty(meta)
        .map_err(|e| DaemonError::Index(codeindex_core::error::IndexError::Serialization(e.to_string())))?;
    std::fs::write(collection.meta_path(), bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    struct NoopChunker;
    impl Chunker for NoopChunker {
        fn chunk(
            &self,
            _path: &std::path::Path,
            _content: &str,
        ) -> codeindex_core::error::Result<Vec<codeindex_core::collaborators::Chunk>> {
            Ok(vec![codeindex_core::collaborators::Chunk {
                text: "fn main() {}".to_string(),
                line_start: 1,
                line_end: 1,
                language: "rust".to_string(),
            }])
        }
    }

    struct ZeroEmbedder;
    impl EmbeddingProvider for ZeroEmbedder {
        fn embed(&self, texts: &[String]) -> codeindex_core::error::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    #[test]
    fn clean_invalidates_cache_before_removing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let state = DaemonState::new(DaemonConfig::default());
        let key = CollectionKey::new(dir.path(), "default");
        let entry = state.ensure_cache_loaded(&key);
        entry.write(|_, _, _, uuid, _| *uuid = "v1".to_string());

        clean(&state, &key, CleanParams::default()).unwrap();

        assert_eq!(entry.hnsw_version_uuid(), "");
    }

    #[test]
    fn clean_data_removes_collection_directory() {
        let dir = tempfile::tempdir().unwrap();
        let state = DaemonState::new(DaemonConfig::default());
        let key = CollectionKey::new(dir.path(), "default");
        std::fs::create_dir_all(key.collection_dir()).unwrap();

        clean_data(&state, &key).unwrap();

        assert!(!key.collection_dir().exists());
    }

    #[test]
    fn index_reports_files_processed_and_skips_hnsw_with_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let state = DaemonState::new(DaemonConfig::default());
        let key = CollectionKey::new(dir.path(), "default");
        let progress: ProgressCallback = std::sync::Arc::new(|_, _, _, _, _| {});

        let stats = index(
            &state,
            &key,
            IndexParams {
                skip_hnsw_rebuild: false,
                files: vec![file],
            },
            progress,
            &NoopChunker,
            &ZeroEmbedder,
        )
        .unwrap();

        assert_eq!(stats.files_processed, 1);
        assert_eq!(stats.failed_files, 0);
    }
}
