//! Error types raised by the daemon/client surface.

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] codeindex_core::error::IndexError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("daemon unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// The `{status, message, kind?}` shape every error payload takes on the
/// RPC boundary (spec §7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub status: String,
    pub message: String,
    pub kind: Option<String>,
}

impl From<&DaemonError> for ErrorPayload {
    fn from(e: &DaemonError) -> Self {
        let kind = match e {
            DaemonError::Index(codeindex_core::error::IndexError::NotFound(_)) => "not_found",
            DaemonError::Index(codeindex_core::error::IndexError::AlreadyRunning(_)) => {
                "already_running"
            }
            DaemonError::Index(codeindex_core::error::IndexError::Stale { .. }) => "stale",
            DaemonError::Index(codeindex_core::error::IndexError::Unavailable(_)) => "unavailable",
            DaemonError::Index(codeindex_core::error::IndexError::InvalidInput(_)) => {
                "invalid_input"
            }
            DaemonError::Index(codeindex_core::error::IndexError::Cancelled) => "cancelled",
            DaemonError::Index(codeindex_core::error::IndexError::Fatal(_)) => "fatal",
            DaemonError::Protocol(_) => "protocol",
            DaemonError::Unavailable(_) => "unavailable",
            DaemonError::Timeout => "timeout",
            DaemonError::InvalidInput(_) => "invalid_input",
            _ => "error",
        };
        Self {
            status: "error".to_string(),
            message: e.to_string(),
            kind: Some(kind.to_string()),
        }
    }
}
