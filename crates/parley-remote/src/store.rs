use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEventKind {
    Added,
    Changed,
    Removed,
}

/// A change to one direct child of a subscribed path.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildEvent {
    pub kind: ChildEventKind,
    pub key: String,
    /// New value, or the last value for `Removed`.
    pub value: Value,
}

/// Range query over the children of a node, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildQuery {
    /// Only keys `>=` this one (inclusive).
    pub start_at: Option<String>,
    /// Keep only the last `n` children after `start_at` is applied.
    pub limit_to_last: Option<usize>,
}

impl ChildQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn start_at(key: impl Into<String>) -> Self {
        Self {
            start_at: Some(key.into()),
            limit_to_last: None,
        }
    }

    pub fn last(n: usize) -> Self {
        Self {
            start_at: None,
            limit_to_last: Some(n),
        }
    }
}

/// Read-modify-write step of a transaction. Receives the current value
/// (`None` if absent) and returns the value to commit, or `None` to abort.
/// Committing `Value::Null` deletes the node.
pub type TransactionFn = Box<dyn FnMut(Option<Value>) -> Option<Value> + Send>;

/// Stops a live subscription when dropped (or when [`stop`](Self::stop) is
/// called). Teardown is synchronous: once this returns, no further events
/// are queued for the subscription.
#[must_use = "dropping the handle stops the subscription"]
pub struct SubscriptionHandle {
    stop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    pub fn new(stop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.stop.is_some())
            .finish()
    }
}

/// Live event stream plus the handle that ends it.
#[derive(Debug)]
pub struct Subscription<E> {
    pub events: mpsc::UnboundedReceiver<E>,
    pub handle: SubscriptionHandle,
}

impl<E> Subscription<E> {
    pub fn new(events: mpsc::UnboundedReceiver<E>, handle: SubscriptionHandle) -> Self {
        Self { events, handle }
    }

    /// Next event, or `None` once the subscription is stopped.
    pub async fn next(&mut self) -> Option<E> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<E>, SubscriptionHandle) {
        (self.events, self.handle)
    }
}

/// One client's connection to the remote real-time store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Point read. `Ok(None)` if nothing is stored at `path`.
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Children of `path` ordered by key, filtered by `query`.
    async fn query_children(&self, path: &str, query: ChildQuery) -> Result<Vec<(String, Value)>>;

    /// Replace the value at `path`; `Value::Null` removes it.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Atomically apply several writes given as paths relative to `path`.
    async fn update(&self, path: &str, patch: Map<String, Value>) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()> {
        self.set(path, Value::Null).await
    }

    /// Atomic read-modify-write on one node. Returns the committed value, or
    /// `None` if `apply` aborted.
    async fn transaction(&self, path: &str, apply: TransactionFn) -> Result<Option<Value>>;

    /// Arm a server-side rule writing `value` at `path` when this connection
    /// drops abruptly.
    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<()>;

    /// Child add/change/remove events under `path`, starting from now.
    fn subscribe_children(&self, path: &str) -> Result<Subscription<ChildEvent>>;

    /// Value changes at `path`; the current value is delivered first.
    fn subscribe_value(&self, path: &str) -> Result<Subscription<Option<Value>>>;

    /// `true` while this connection can reach the store.
    fn connectivity(&self) -> watch::Receiver<bool>;

    fn is_connected(&self) -> bool {
        *self.connectivity().borrow()
    }
}
