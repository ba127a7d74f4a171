//! External collaborators consumed by the engine.
//!
//! Encryption is keyed by room and reports [`CryptoError`]; the media and
//! profile services are plain async lookups returning `anyhow::Result`.

use std::sync::Arc;

use async_trait::async_trait;

use parley_shared::crypto::RoomKeyCipher;
use parley_shared::{CryptoError, Profile, RoomId, UserId};

#[async_trait]
pub trait Encryption: Send + Sync {
    async fn encrypt(&self, room: &RoomId, plaintext: &str) -> Result<String, CryptoError>;
    async fn decrypt(&self, room: &RoomId, ciphertext: &str) -> Result<String, CryptoError>;
}

#[async_trait]
impl Encryption for RoomKeyCipher {
    async fn encrypt(&self, room: &RoomId, plaintext: &str) -> Result<String, CryptoError> {
        self.encrypt_text(room, plaintext)
    }

    async fn decrypt(&self, room: &RoomId, ciphertext: &str) -> Result<String, CryptoError> {
        self.decrypt_text(room, ciphertext)
    }
}

/// Presigned upload destination returned by the media service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub url: String,
    pub media_id: String,
}

#[async_trait]
pub trait Media: Send + Sync {
    /// Fresh presigned download URL for `media_id`.
    async fn download_url(&self, media_id: &str) -> anyhow::Result<String>;

    async fn upload_target(&self, media_type: &str, size: u64) -> anyhow::Result<UploadTarget>;
}

#[async_trait]
pub trait Profiles: Send + Sync {
    /// `Ok(None)` when the user has no profile.
    async fn profile(&self, user: &UserId) -> anyhow::Result<Option<Profile>>;
}

#[derive(Clone)]
pub struct Capabilities {
    pub encryption: Arc<dyn Encryption>,
    pub media: Arc<dyn Media>,
    pub profiles: Arc<dyn Profiles>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
