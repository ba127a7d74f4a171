use thiserror::Error;

use parley_remote::RemoteError;
use parley_shared::{CryptoError, WireError};
use parley_store::StoreError;

/// Errors surfaced by the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote store could not be reached or refused the operation.
    #[error("Remote store error: {0}")]
    Transient(#[from] RemoteError),

    /// A room, profile or message that was expected to exist is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ciphertext could not be encrypted or decrypted.
    #[error("Crypto error: {0}")]
    Decrypt(#[from] CryptoError),

    /// A local cache write kept conflicting and was dropped.
    #[error("Local cache conflict on {what} '{key}'")]
    CacheConflict { what: &'static str, key: String },

    /// A malformed action or argument, rejected before any write.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// A record read from the remote store does not have the expected shape.
    #[error("Malformed record: {0}")]
    Malformed(#[from] WireError),

    #[error("Local cache error: {0}")]
    Store(#[from] StoreError),

    /// An external capability (media, profiles) failed.
    #[error("Capability error: {0}")]
    Capability(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether retrying later (offline queue, next sync pass) can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transient(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
