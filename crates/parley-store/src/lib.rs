//! # parley-store
//!
//! Local persistent cache for the Parley sync engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for conversations,
//! messages, attachments, contacts, per-room cursors and the pending-action
//! queue. Documents that the engine updates with read-modify-write carry a
//! revision; writes with a stale revision fail with [`StoreError::Conflict`].

pub mod attachments;
pub mod contacts;
pub mod conversations;
pub mod cursors;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod pending_actions;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
