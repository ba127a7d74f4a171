/// Application name
pub const APP_NAME: &str = "Parley";

/// Messages loaded per local backfill page
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// A typing flag is cleared automatically after this long (milliseconds)
pub const TYPING_TIMEOUT_MS: u64 = 3_000;

/// Attempts made for a conflicting local cache write before giving up
pub const CACHE_RETRY_ATTEMPTS: u32 = 4;

/// Backoff before the first cache write retry (milliseconds), doubled per attempt
pub const CACHE_RETRY_BASE_MS: u64 = 15;

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Key derivation context for per-room keys (BLAKE3)
pub const KDF_CONTEXT_ROOM_KEY: &str = "parley-room-key-v1";

/// Random hex characters appended to the time prefix of a message id
pub const MSG_ID_RANDOM_LEN: usize = 8;

/// Shown when a message body cannot be decrypted and no ciphertext is available
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[message unavailable]";

/// Default `lastmessageType` for plain text messages
pub const TEXT_MESSAGE_TYPE: &str = "text";

/// Characters the remote store refuses inside a single path segment
pub const FORBIDDEN_KEY_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];
