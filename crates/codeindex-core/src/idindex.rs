//! Point-id to file-path mapping, mmap-backed (C3).
//!
//! Same rebuild/swap discipline as the HNSW store, via [`AtomicRebuilder`].
//! There is no soft delete here: a deletion simply drops the entry and the
//! change is carried by the next rebuild.

use std::collections::BTreeMap;
use std::fs;

use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rebuild::AtomicRebuilder;
use crate::types::Collection;

/// `point_id -> relative_path`. `BTreeMap` keeps the on-disk encoding
/// deterministic, which matters for the atomic-swap round-trip tests.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IdIndex {
    entries: BTreeMap<String, String>,
}

impl IdIndex {
    pub fn get(&self, point_id: &str) -> Option<&str> {
        self.entries.get(point_id).map(String::as_str)
    }

    pub fn insert(&mut self, point_id: impl Into<String>, path: impl Into<String>) {
        self.entries.insert(point_id.into(), path.into());
    }

    pub fn remove(&mut self, point_id: &str) -> Option<String> {
        self.entries.remove(point_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub struct IdIndexStore;

impl IdIndexStore {
    /// Loads `id_index.bin` via `memmap2`, or an empty index if the file is
    /// absent (a fresh collection before its first rebuild).
    pub fn load(collection: &Collection) -> Result<IdIndex> {
        let path = collection.id_index_path();
        if !path.exists() {
            return Ok(IdIndex::default());
        }
        let file = fs::File::open(&path)?;
        // SAFETY: `id_index.bin` is only ever replaced wholesale by
        // AtomicRebuilder's rename-based swap, never truncated in place.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(postcard::from_bytes(&mmap)?)
    }

    /// Writes `index` to a temp file and swaps it into place via
    /// [`AtomicRebuilder`]. Used on full rebuilds; incremental mutation
    /// happens in memory and is only flushed at session end.
    pub fn save(collection: &Collection, index: &IdIndex) -> Result<()> {
        let rebuilder = AtomicRebuilder::new(&collection.root);
        let target = collection.id_index_path();
        let bytes = postcard::to_allocvec(index)?;
        rebuilder.rebuild_with_lock(&target, |tmp| {
            fs::write(tmp, &bytes)?;
            Ok(())
        })
    }

    pub fn path_for<'a>(id_index: &'a IdIndex, point_id: &str) -> Option<&'a str> {
        id_index.get(point_id)
    }
}
