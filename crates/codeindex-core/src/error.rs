//! Error types raised by the index engine.

use std::path::PathBuf;

/// Errors raised by the index engine.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("collection not found: {0}")]
    NotFound(PathBuf),

    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    #[error("rebuild lock unavailable for {0}")]
    LockContention(PathBuf),

    #[error("index stale: on-disk uuid {on_disk} != cached uuid {cached}")]
    Stale { on_disk: String, cached: String },

    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("external collaborator failed: {0}")]
    ExternalFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("hnsw error: {0}")]
    Hnsw(String),

    #[error("fts error: {0}")]
    Fts(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl From<postcard::Error> for IndexError {
    fn from(e: postcard::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(e: tantivy::TantivyError) -> Self {
        IndexError::Fts(e.to_string())
    }
}
