//! Core data types shared across the index engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One indexed chunk of source code.
///
/// Owned (the vector copy) by the HNSW store once inserted; referenced by
/// the ID index (path) and the FTS store (match text). Mutated only by
/// re-insert under the same `point_id`; removed by soft-delete (HNSW) and
/// hard removal (ID index, FTS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    /// Stable id derived from content hash + path + chunk index.
    pub point_id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// Metadata carried alongside a point's vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub path: String,
    pub line_start: u32,
    pub line_end: u32,
    pub language: String,
    pub git_ref: Option<String>,
}

/// On-disk directory `<project>/.code-indexer/index/<collection_name>/`.
#[derive(Debug, Clone)]
pub struct Collection {
    pub root: PathBuf,
}

impl Collection {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the live `hnsw_rs` artifact pair
    /// (`hnsw_index.hnsw.graph` + `hnsw_index.hnsw.data`), swapped into
    /// place as a unit so a reader never observes one file without the
    /// other.
    pub fn hnsw_index_dir(&self) -> PathBuf {
        self.root.join("hnsw_index")
    }

    pub fn id_index_path(&self) -> PathBuf {
        self.root.join("id_index.bin")
    }

    /// Persisted `point_id -> embedding` table, the corpus `end_indexing`
    /// reads back for full rebuilds and incremental per-point lookups.
    pub fn vector_store_path(&self) -> PathBuf {
        self.root.join("vectors.bin")
    }

    pub fn tantivy_dir(&self) -> PathBuf {
        self.root.join("tantivy_index")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join("collection_meta.json")
    }

    pub fn rebuild_lock_path(&self) -> PathBuf {
        self.root.join(".index_rebuild.lock")
    }
}

/// `collection_meta.json` schema (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub hnsw_index: HnswMeta,
    pub fts_index: FtsMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswMeta {
    pub version: u32,
    pub index_rebuild_uuid: String,
    pub vector_count: usize,
    pub vector_dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub space: String,
    pub last_rebuild: chrono::DateTime<chrono::Utc>,
    pub is_stale: bool,
    pub last_marked_stale: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for HnswMeta {
    fn default() -> Self {
        Self {
            version: 1,
            index_rebuild_uuid: uuid::Uuid::nil().to_string(),
            vector_count: 0,
            vector_dim: 0,
            m: 16,
            ef_construction: 200,
            space: "cosine".to_string(),
            last_rebuild: chrono::Utc::now(),
            is_stale: false,
            last_marked_stale: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FtsMeta {
    pub index_rebuild_uuid: String,
    pub document_count: usize,
    pub last_rebuild: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-file state surfaced through the indexing progress callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    pub state: FileProcessState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileProcessState {
    Pending,
    Chunking,
    Embedding,
    Done,
    Failed,
}

/// Identifies a collection by project path + collection name; used as the
/// cache map key and as the fingerprint for on-disk paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub project_path: PathBuf,
    pub collection_name: String,
}

impl CollectionKey {
    pub fn new(project_path: impl Into<PathBuf>, collection_name: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            collection_name: collection_name.into(),
        }
    }

    pub fn collection_dir(&self) -> PathBuf {
        self.project_path
            .join(".code-indexer")
            .join("index")
            .join(&self.collection_name)
    }
}

/// A semantic or full-text search result row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticResult {
    pub payload: Payload,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtsResult {
    pub path: String,
    pub line: u32,
    pub column: u32,
    pub language: String,
    pub match_text: String,
    pub snippet: String,
}

pub fn canonicalize_existing_path(path: &Path) -> std::io::Result<PathBuf> {
    path.canonicalize()
}
