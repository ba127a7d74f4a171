use thiserror::Error;

/// Errors produced by a remote store connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The store is unreachable from this connection. Transient.
    #[error("Remote store unavailable")]
    Unavailable,

    /// The store refused the operation (rules, quota, injected failure).
    #[error("Remote store rejected {op} at {path}")]
    Rejected { op: &'static str, path: String },

    /// A path segment is empty or contains a forbidden character.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RemoteError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable | RemoteError::Rejected { .. })
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        RemoteError::Serialization(e.to_string())
    }
}

impl From<parley_shared::WireError> for RemoteError {
    fn from(e: parley_shared::WireError) -> Self {
        RemoteError::Serialization(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RemoteError>;
