use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_ROOM_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;
use crate::types::RoomId;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Poly1305 authentication tag size in bytes
const TAG_SIZE: usize = 16;

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation
pub fn derive_room_key(master: &SymmetricKey, room_id: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOM_KEY);
    hasher.update(master);
    hasher.update(room_id);
    *hasher.finalize().as_bytes()
}

/// Text cipher keyed per room from one master secret. Output is base64 so
/// it can sit in JSON on the wire and in the local cache.
#[derive(Clone)]
pub struct RoomKeyCipher {
    master: SymmetricKey,
}

impl RoomKeyCipher {
    pub fn new(master: SymmetricKey) -> Self {
        Self { master }
    }

    pub fn from_slice(master: &[u8]) -> Result<Self, CryptoError> {
        let master: SymmetricKey = master
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self::new(master))
    }

    pub fn encrypt_text(&self, room: &RoomId, plaintext: &str) -> Result<String, CryptoError> {
        let key = derive_room_key(&self.master, room.as_str().as_bytes());
        let sealed = encrypt(&key, plaintext.as_bytes())?;
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt_text(&self, room: &RoomId, ciphertext: &str) -> Result<String, CryptoError> {
        let key = derive_room_key(&self.master, room.as_str().as_bytes());
        let data = STANDARD.decode(ciphertext)?;
        let plaintext = decrypt(&key, &data)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }
}

/// Whether `text` has the shape of [`RoomKeyCipher`] output (base64 of at
/// least a nonce and a tag). Legacy clients stored some messages in the
/// clear; those fail this check and can be shown as-is.
pub fn looks_sealed(text: &str) -> bool {
    STANDARD
        .decode(text)
        .map(|data| data.len() >= NONCE_SIZE + TAG_SIZE)
        .unwrap_or(false)
}

impl std::fmt::Debug for RoomKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKeyCipher").finish_non_exhaustive()
    }
}
