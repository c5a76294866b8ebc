//! In-process fallback path used when the daemon is unreachable (spec
//! §4.11's standalone fallback). Wires the same [`DaemonService`] the
//! server dispatches against, directly in this process — no socket, no
//! frame protocol — so query/index/watch semantics are identical whether
//! or not the daemon could be reached. The client decides when to fall
//! back here; this module only needs to run the pipeline once asked.

use std::path::PathBuf;
use std::sync::Arc;

use codeindex_core::collaborators::{Chunker, EmbeddingProvider, GitTopology};
use codeindex_core::fts::FtsSearchOptions;
use codeindex_core::indexing::{IndexingStats, ProgressCallback};
use codeindex_core::types::{CollectionKey, FtsResult};
use codeindex_core::watch::WatchDeps;

use crate::config::DaemonConfig;
use crate::service::{DaemonService, IndexParams, QueryFilters, QueryResponse};

pub struct Standalone {
    service: DaemonService,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    git: Arc<dyn GitTopology>,
}

impl Standalone {
    pub fn new(
        config: DaemonConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Arc<dyn Chunker>,
        git: Arc<dyn GitTopology>,
    ) -> Self {
        Self {
            service: DaemonService::new(config),
            embedder,
            chunker,
            git,
        }
    }

    /// Prints the user-visible notice spec §4.11 requires, naming why the
    /// daemon path was abandoned.
    pub fn announce(reason: &str) {
        eprintln!("Daemon unavailable ({reason}); running standalone.");
    }

    pub fn query(
        &self,
        key: &CollectionKey,
        query_text: &str,
        limit: usize,
        filters: &QueryFilters,
    ) -> crate::Result<QueryResponse> {
        self.service
            .query(key, query_text, limit, filters, self.embedder.as_ref())
    }

    pub fn query_fts(
        &self,
        key: &CollectionKey,
        query_text: &str,
        opts: &FtsSearchOptions,
    ) -> crate::Result<Vec<FtsResult>> {
        self.service.query_fts(key, query_text, opts)
    }

    pub fn query_hybrid(
        &self,
        key: &CollectionKey,
        query_text: &str,
        limit: usize,
    ) -> crate::Result<Vec<crate::service::HybridResult>> {
        self.service
            .query_hybrid(key, query_text, limit, self.embedder.as_ref())
    }

    pub fn index(
        &self,
        key: &CollectionKey,
        params: IndexParams,
        progress: ProgressCallback,
    ) -> crate::Result<IndexingStats> {
        self.service
            .index(key, params, progress, self.chunker.as_ref(), self.embedder.as_ref())
    }

    pub fn watch_start(&self, root: PathBuf, key: &CollectionKey) -> crate::Result<()> {
        *self.service.state.watch_deps.lock() = Some(Arc::new(WatchDeps {
            chunker: self.chunker.clone(),
            embedder: self.embedder.clone(),
            git: self.git.clone(),
        }));
        self.service.watch_start(root, key)
    }

    pub fn status(&self, key: &CollectionKey) -> crate::service::StatusResponse {
        self.service.status(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeindex_core::collaborators::{Chunk, GitCliTopology};
    use codeindex_core::error::Result as IndexResult;
    use std::path::Path;

    struct ZeroEmbedder;
    impl EmbeddingProvider for ZeroEmbedder {
        fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dimensions(&self) -> usize {
            4
        }
    }

    struct NoopChunker;
    impl Chunker for NoopChunker {
        fn chunk(&self, _path: &Path, _content: &str) -> IndexResult<Vec<Chunk>> {
            Ok(Vec::new())
        }
    }

    fn standalone(dir: &Path) -> Standalone {
        Standalone::new(
            DaemonConfig::default(),
            Arc::new(ZeroEmbedder),
            Arc::new(NoopChunker),
            Arc::new(GitCliTopology::new(dir)),
        )
    }

    #[test]
    fn query_runs_in_process_without_a_socket() {
        let dir = tempfile::tempdir().unwrap();
        let key = CollectionKey::new(dir.path(), "default");

        let response = standalone(dir.path())
            .query(&key, "anything", 5, &QueryFilters::default())
            .unwrap();

        assert!(response.results.is_empty());
        assert_eq!(response.timing.path, "rebuild");
    }

    #[test]
    fn status_reports_unloaded_cache_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let key = CollectionKey::new(dir.path(), "default");

        let response = standalone(dir.path()).status(&key);

        assert!(!response.cache.loaded);
    }
}
