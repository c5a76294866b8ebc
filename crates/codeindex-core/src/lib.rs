//! Memory-resident index engine for a local code-intelligence daemon.
//!
//! A project's source tree is indexed into two on-disk structures — a
//! dense-vector HNSW index for semantic search and a full-text index for
//! keyword/regex search — and held memory-resident behind a single
//! reader-writer lock so repeat queries avoid the cold-load cost. Index
//! rebuilds are performed atomically under a cross-process file lock so
//! queries never observe a partially-written index.
//!
//! Layout:
//! - [`rebuild`] — build-to-temp + atomic-rename swap serialized by `flock`.
//! - [`hnsw`] — mmap-backed dense index, wraps `hnsw_rs`.
//! - [`idindex`] — point-id to path mapping, mmap-backed.
//! - [`fts`] — directory-based full-text index, wraps `tantivy`.
//! - [`cache`] — per-project RW-locked holder of the three stores.
//! - [`eviction`] — background TTL eviction of idle cache entries.
//! - [`indexing`] — single-flight background indexing job + change tracking.
//! - [`watch`] — filesystem watcher driving incremental store updates.
//! - [`collaborators`] — trait contracts for external dependencies.

pub mod cache;
pub mod cancel;
pub mod collaborators;
pub mod error;
pub mod eviction;
pub mod fts;
pub mod hnsw;
pub mod idindex;
pub mod indexing;
pub mod rebuild;
pub mod types;
pub mod vectors;
pub mod watch;

pub use cache::CacheEntry;
pub use error::{IndexError, Result};
pub use types::{Collection, CollectionMeta, Point};
