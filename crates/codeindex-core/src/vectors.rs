//! Point-id to embedding table, mmap-backed. Persists the real vectors
//! produced during indexing so `IndexingCoordinator::end_indexing` can read
//! back a full corpus (rebuild) or a single point (incremental update)
//! without holding the whole session's embeddings in memory across calls.
//!
//! Same rebuild/swap discipline as [`crate::idindex::IdIndexStore`].

use std::collections::BTreeMap;
use std::fs;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rebuild::AtomicRebuilder;
use crate::types::Collection;

/// `point_id -> embedding`. `BTreeMap` keeps the on-disk encoding
/// deterministic, matching `IdIndex`'s rebuild/swap contract.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct VectorTable {
    entries: BTreeMap<String, Vec<f32>>,
}

impl VectorTable {
    pub fn get(&self, point_id: &str) -> Option<&[f32]> {
        self.entries.get(point_id).map(Vec::as_slice)
    }

    pub fn insert(&mut self, point_id: impl Into<String>, vector: Vec<f32>) {
        self.entries.insert(point_id.into(), vector);
    }

    pub fn remove(&mut self, point_id: &str) -> Option<Vec<f32>> {
        self.entries.remove(point_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

pub struct VectorStore;

impl VectorStore {
    /// Loads `vectors.bin` via `memmap2`, or an empty table if the file is
    /// absent (a fresh collection before its first embed).
    pub fn load(collection: &Collection) -> Result<VectorTable> {
        let path = collection.vector_store_path();
        if !path.exists() {
            return Ok(VectorTable::default());
        }
        let file = fs::File::open(&path)?;
        // SAFETY: `vectors.bin` is only ever replaced wholesale by
        // AtomicRebuilder's rename-based swap, never truncated in place.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(postcard::from_bytes(&mmap)?)
    }

    /// Writes `table` to a temp file and swaps it into place via
    /// [`AtomicRebuilder`].
    pub fn save(collection: &Collection, table: &VectorTable) -> Result<()> {
        let rebuilder = AtomicRebuilder::new(&collection.root);
        let target = collection.vector_store_path();
        let bytes = postcard::to_allocvec(table)?;
        rebuilder.rebuild_with_lock(&target, |tmp| {
            fs::write(tmp, &bytes)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        let mut table = VectorTable::default();
        table.insert("pt1", vec![0.1, 0.2, 0.3]);

        VectorStore::save(&collection, &table).unwrap();
        let reloaded = VectorStore::load(&collection).unwrap();

        assert_eq!(reloaded.get("pt1"), Some(&[0.1, 0.2, 0.3][..]));
    }

    #[test]
    fn load_of_missing_file_returns_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        let table = VectorStore::load(&collection).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn remove_then_save_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let collection = Collection::new(dir.path());
        let mut table = VectorTable::default();
        table.insert("pt1", vec![1.0, 2.0]);
        table.remove("pt1");

        VectorStore::save(&collection, &table).unwrap();
        let reloaded = VectorStore::load(&collection).unwrap();
        assert!(reloaded.is_empty());
    }
}
