//! # parley-shared
//!
//! Types shared by every parley crate: identifiers, the domain model handed
//! to the UI layer, the wire records exchanged with the remote real-time
//! store, the receipt state machine and the default room cipher.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod model;
pub mod protocol;
pub mod receipts;
pub mod types;

pub use error::{CryptoError, WireError};
pub use model::*;
pub use types::{MsgId, RoomId, UserId};
