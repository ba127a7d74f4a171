//! Remote real-time store contract.
//!
//! The server keeps a JSON tree addressed by `/`-separated paths. Clients do
//! point reads, point and multi-path writes, atomic transactions on one
//! node, and subscribe to child or value changes. Each connection also
//! exposes a connectivity signal and server-side on-disconnect rules.

pub mod error;
pub mod memory;
pub mod path;
pub mod store;

pub use error::{RemoteError, Result};
pub use memory::{MemoryBackend, MemoryRemote, QueryRecord, WriteKind, WriteRecord};
pub use store::{
    ChildEvent, ChildEventKind, ChildQuery, RemoteStore, Subscription, SubscriptionHandle,
    TransactionFn,
};
