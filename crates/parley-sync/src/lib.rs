//! # parley-sync
//!
//! Chat synchronization and presence engine. A [`SyncContext`] owns one
//! user's engines and keeps conversations, messages, presence and receipt
//! state consistent between the remote real-time store, the local cache and
//! the reactive containers handed to the UI layer.

pub mod actions;
pub mod attachments;
pub mod cache;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod conversations;
pub mod error;
pub mod events;
pub mod logging;
pub mod messages;
pub mod offline_queue;
pub mod presence;
pub mod receipts;

mod listener;

#[cfg(test)]
pub(crate) mod test_support;

pub use actions::{ActionOutcome, SocialActions};
pub use capabilities::{Capabilities, Encryption, Media, Profiles, UploadTarget};
pub use config::SyncConfig;
pub use context::SyncContext;
pub use error::SyncError;
pub use events::SyncEvent;
pub use offline_queue::{ActionApplier, DrainReport, OfflineQueue};
pub use presence::TrackHandle;
