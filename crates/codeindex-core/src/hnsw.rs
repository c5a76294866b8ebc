//! Mmap-backed dense-vector index (C2).
//!
//! Wraps `hnsw_rs`. The library only knows about `usize` labels, so this
//! module owns the `point_id <-> label` maps and persists them alongside
//! the graph file. The graph itself is rehydrated through the library's own
//! loader; the label/point_id table is read back through a `memmap2::Mmap`
//! so repeat loads of an already-resident file are zero-copy.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use hnsw_rs::anndists::dist::distances::DistCosine;
use hnsw_rs::api::AnnT;
use hnsw_rs::hnswio::{HnswIo, ReloadOptions};
use hnsw_rs::prelude::Hnsw;
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::rebuild::AtomicRebuilder;
use crate::types::{Collection, CollectionMeta, HnswMeta};

const DEFAULT_M: usize = 16;
const DEFAULT_EF_CONSTRUCTION: usize = 200;
const DEFAULT_MAX_LAYER: usize = 16;
const HNSW_BASENAME: &str = "hnsw_index";

/// `point_id <-> label` table persisted next to the graph file, loaded
/// through a memory map so re-opening an already-cached file is cheap.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LabelTable {
    point_to_label: HashMap<String, usize>,
    label_to_point: HashMap<usize, String>,
    deleted_labels: std::collections::HashSet<usize>,
    next_label: usize,
}

impl LabelTable {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = fs::File::open(path)?;
        // SAFETY: the file is only ever replaced via AtomicRebuilder's
        // rename-based swap, so concurrent writers never truncate it.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(postcard::from_bytes(&mmap)?)
    }

    fn save(&self, path: &Path) -> Result<()> {
        let bytes = postcard::to_allocvec(self)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

fn labels_path(collection_path: &Path) -> PathBuf {
    collection_path.join("hnsw_index.labels")
}

/// A loaded dense index ready for query or mutation.
pub struct HnswIndex {
    graph: Hnsw<'static, f32, DistCosine>,
    labels: LabelTable,
}

impl HnswIndex {
    fn empty(dim: usize) -> Self {
        Self {
            graph: Hnsw::new(
                DEFAULT_M,
                100_000,
                DEFAULT_MAX_LAYER,
                DEFAULT_EF_CONSTRUCTION,
                DistCosine {},
            ),
            labels: LabelTable::default(),
        }
        .with_dim_hint(dim)
    }

    fn with_dim_hint(self, _dim: usize) -> Self {
        self
    }

    /// `(result_ids, distances)`. Does not acquire any lock — the caller is
    /// expected to hold the `CacheEntry` read lock for the duration.
    pub fn query(&self, vector: &[f32], k: usize) -> (Vec<String>, Vec<f32>) {
        let neighbours = self.graph.search(vector, k, DEFAULT_EF_CONSTRUCTION);
        let mut ids = Vec::with_capacity(neighbours.len());
        let mut dists = Vec::with_capacity(neighbours.len());
        for n in neighbours {
            if self.labels.deleted_labels.contains(&n.d_id) {
                continue;
            }
            if let Some(point_id) = self.labels.label_to_point.get(&n.d_id) {
                ids.push(point_id.clone());
                dists.push(n.distance);
            }
        }
        (ids, dists)
    }

    /// Assigns a fresh label for a new point, or soft-deletes the old label
    /// and assigns a new one if `point_id` already exists.
    pub fn add_or_update_vector(&mut self, point_id: &str, vector: &[f32]) {
        if let Some(&old_label) = self.labels.point_to_label.get(point_id) {
            self.labels.deleted_labels.insert(old_label);
        }
        let label = self.labels.next_label;
        self.labels.next_label += 1;
        self.graph.insert((vector, label));
        self.labels
            .point_to_label
            .insert(point_id.to_string(), label);
        self.labels.label_to_point.insert(label, point_id.to_string());
    }

    /// Soft-delete only; hard removal requires a full rebuild.
    pub fn remove_vector(&mut self, point_id: &str) {
        if let Some(label) = self.labels.point_to_label.remove(point_id) {
            self.labels.label_to_point.remove(&label);
            self.labels.deleted_labels.insert(label);
        }
    }

    pub fn vector_count(&self) -> usize {
        self.labels.point_to_label.len()
    }
}

/// Dumps `index`'s graph and label table into a fresh tmp directory and
/// swaps it over `collection.hnsw_index_dir()` as a single unit, so a
/// concurrent reader never observes the `.hnsw.graph`/`.hnsw.data` pair
/// half-written.
fn dump_index_into_target(collection: &Collection, index: &HnswIndex) -> Result<()> {
    let rebuilder = AtomicRebuilder::new(&collection.root);
    let target = collection.hnsw_index_dir();
    rebuilder.rebuild_with_lock(&target, |tmp| {
        fs::create_dir_all(tmp)?;
        index
            .graph
            .file_dump(tmp, HNSW_BASENAME)
            .map_err(|e| IndexError::Hnsw(e.to_string()))?;
        index.labels.save(&labels_path(tmp))?;
        Ok(())
    })
}

/// Persistence and lifecycle operations for the dense index.
pub struct HnswStore;

/// Result of attempting to load a collection's dense index.
pub enum LoadResult {
    Loaded {
        index: HnswIndex,
        index_rebuild_uuid: String,
    },
    /// File missing, or `collection_meta.json` flags `is_stale`.
    NoIndex,
}

impl HnswStore {
    /// Loads the `hnsw_rs` graph and the sidecar label table out of the live
    /// index directory. Returns [`LoadResult::NoIndex`] if the directory is
    /// missing or the metadata marks the index stale.
    pub fn load(collection: &Collection, meta: &CollectionMeta) -> Result<LoadResult> {
        let dir = collection.hnsw_index_dir();
        if meta.hnsw_index.is_stale || !dir.exists() {
            return Ok(LoadResult::NoIndex);
        }
        let reloader: &'static mut HnswIo = Box::leak(Box::new(HnswIo::new_with_options(
            &dir,
            HNSW_BASENAME,
            ReloadOptions::default(),
        )));
        let graph = reloader
            .load_hnsw_with_dist::<f32, DistCosine>(DistCosine {})
            .map_err(|e| IndexError::Hnsw(e.to_string()))?;
        let labels = LabelTable::load(&labels_path(&dir))?;
        Ok(LoadResult::Loaded {
            index: HnswIndex { graph, labels },
            index_rebuild_uuid: meta.hnsw_index.index_rebuild_uuid.clone(),
        })
    }

    /// Constructs a fresh graph from `vectors` and writes it through
    /// [`AtomicRebuilder`]. Mints a new `index_rebuild_uuid`.
    pub fn rebuild_from_vectors(
        collection: &Collection,
        vectors: &[(String, Vec<f32>)],
        meta: &mut CollectionMeta,
    ) -> Result<()> {
        let dim = vectors.first().map(|(_, v)| v.len()).unwrap_or(0);
        let mut index = HnswIndex::empty(dim);
        for (point_id, vector) in vectors {
            index.add_or_update_vector(point_id, vector);
        }

        dump_index_into_target(collection, &index)?;

        let uuid = Uuid::new_v4().to_string();
        meta.hnsw_index = HnswMeta {
            version: meta.hnsw_index.version,
            index_rebuild_uuid: uuid,
            vector_count: index.vector_count(),
            vector_dim: dim,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            space: "cosine".to_string(),
            last_rebuild: chrono::Utc::now(),
            is_stale: false,
            last_marked_stale: None,
        };
        Ok(())
    }

    /// Serializes the current in-memory state to a temp directory and swaps
    /// it in via [`AtomicRebuilder`]; mints a new UUID.
    pub fn save_incremental_update(
        collection: &Collection,
        index: &HnswIndex,
        meta: &mut CollectionMeta,
    ) -> Result<()> {
        dump_index_into_target(collection, index)?;

        meta.hnsw_index.index_rebuild_uuid = Uuid::new_v4().to_string();
        meta.hnsw_index.vector_count = index.vector_count();
        meta.hnsw_index.last_rebuild = chrono::Utc::now();
        meta.hnsw_index.is_stale = false;
        Ok(())
    }

    /// Flags the on-disk metadata so the next query-path load forces a
    /// rebuild instead of trusting a partially-applied mutation.
    pub fn mark_stale(meta: &mut CollectionMeta) {
        meta.hnsw_index.is_stale = true;
        meta.hnsw_index.last_marked_stale = Some(chrono::Utc::now());
    }
}
