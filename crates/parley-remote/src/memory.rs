//! In-process remote store.
//!
//! A [`MemoryBackend`] plays the server: one JSON tree, every listener, the
//! write log. Each client gets its own [`MemoryRemote`] connection from
//! [`MemoryBackend::connect`] with an independent connectivity flag and its
//! own on-disconnect rules, which fire when the connection is dropped with
//! [`MemoryRemote::set_connected`]`(false)`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::{RemoteError, Result};
use crate::path;
use crate::store::{
    ChildEvent, ChildEventKind, ChildQuery, RemoteStore, Subscription, SubscriptionHandle,
    TransactionFn,
};

// ---------------------------------------------------------------------------
// Write log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Set,
    Update,
    Transaction,
    OnDisconnect,
}

/// One committed write, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub kind: WriteKind,
    /// Path the operation was issued at (`""` for the root).
    pub path: String,
    /// Every absolute path the write replaced or removed.
    pub touched: Vec<String>,
    pub connection: u64,
}

/// One child range read, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    pub path: String,
    pub query: ChildQuery,
    /// Number of children returned.
    pub returned: usize,
    pub connection: u64,
}

// ---------------------------------------------------------------------------
// Backend state
// ---------------------------------------------------------------------------

enum Sink {
    Children(mpsc::UnboundedSender<ChildEvent>),
    Value(mpsc::UnboundedSender<Option<Value>>),
}

struct Listener {
    path: Vec<String>,
    sink: Sink,
}

struct BackendState {
    tree: Value,
    next_id: u64,
    listeners: BTreeMap<u64, Listener>,
    write_log: Vec<WriteRecord>,
    query_log: Vec<QueryRecord>,
    /// Path prefixes whose next write is rejected.
    failures: Vec<Vec<String>>,
}

impl BackendState {
    fn new() -> Self {
        Self {
            tree: Value::Object(Map::new()),
            next_id: 1,
            listeners: BTreeMap::new(),
            write_log: Vec::new(),
            query_log: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn take_failure(&mut self, segs: &[String]) -> bool {
        match self
            .failures
            .iter()
            .position(|prefix| path::is_ancestor_or_self(prefix, segs))
        {
            Some(idx) => {
                self.failures.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Apply writes as one atomic step and notify every affected listener.
    fn commit(&mut self, writes: Vec<(Vec<String>, Value)>) {
        let affected: Vec<(u64, Option<Value>)> = self
            .listeners
            .iter()
            .filter(|(_, l)| {
                writes.iter().any(|(w, _)| {
                    path::is_ancestor_or_self(&l.path, w) || path::is_ancestor_or_self(w, &l.path)
                })
            })
            .map(|(id, l)| (*id, node_at(&self.tree, &l.path).cloned()))
            .collect();

        for (segs, value) in writes {
            write_at(&mut self.tree, &segs, prune(value));
        }

        for (id, before) in affected {
            let Some(listener) = self.listeners.get(&id) else {
                continue;
            };
            let after = node_at(&self.tree, &listener.path).cloned();
            match &listener.sink {
                Sink::Value(tx) => {
                    if before != after {
                        let _ = tx.send(after);
                    }
                }
                Sink::Children(tx) => {
                    for event in diff_children(before.as_ref(), after.as_ref()) {
                        let _ = tx.send(event);
                    }
                }
            }
        }
    }

    fn register(&mut self, path: Vec<String>, sink: Sink) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.insert(id, Listener { path, sink });
        id
    }
}

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn owned_segments(p: &str) -> Result<Vec<String>> {
    Ok(path::segments(p)?.into_iter().map(str::to_string).collect())
}

// ---------------------------------------------------------------------------
// Tree helpers
// ---------------------------------------------------------------------------

fn node_at<'a>(root: &'a Value, segs: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = node.as_object()?.get(seg)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}

/// Drop nulls and empty objects, as the store never keeps either.
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() {
                Value::Null
            } else {
                Value::Object(pruned)
            }
        }
        other => other,
    }
}

fn write_at(node: &mut Value, segs: &[String], value: Value) {
    if segs.is_empty() {
        *node = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return;
    }
    if value.is_null() {
        remove_at(node, segs);
        return;
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(segs[0].clone()).or_insert(Value::Null);
        write_at(child, &segs[1..], value);
    }
}

fn remove_at(node: &mut Value, segs: &[String]) {
    let Value::Object(map) = node else {
        return;
    };
    if segs.len() == 1 {
        map.remove(&segs[0]);
        return;
    }
    if let Some(child) = map.get_mut(&segs[0]) {
        remove_at(child, &segs[1..]);
        if child.as_object().is_some_and(Map::is_empty) {
            map.remove(&segs[0]);
        }
    }
}

fn children(value: Option<&Value>) -> BTreeMap<&str, &Value> {
    match value {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
        _ => BTreeMap::new(),
    }
}

fn diff_children(before: Option<&Value>, after: Option<&Value>) -> Vec<ChildEvent> {
    let before = children(before);
    let after = children(after);
    let keys: BTreeSet<&str> = before.keys().chain(after.keys()).copied().collect();

    keys.into_iter()
        .filter_map(|key| match (before.get(key), after.get(key)) {
            (None, Some(v)) => Some(ChildEvent {
                kind: ChildEventKind::Added,
                key: key.to_string(),
                value: (*v).clone(),
            }),
            (Some(old), Some(new)) if old != new => Some(ChildEvent {
                kind: ChildEventKind::Changed,
                key: key.to_string(),
                value: (*new).clone(),
            }),
            (Some(old), None) => Some(ChildEvent {
                kind: ChildEventKind::Removed,
                key: key.to_string(),
                value: (*old).clone(),
            }),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// The shared server side. Cheap to clone.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    next_connection: Arc<Mutex<u64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::new())),
            next_connection: Arc::new(Mutex::new(1)),
        }
    }

    /// Open a new client connection, initially online.
    pub fn connect(&self) -> MemoryRemote {
        let id = {
            let mut next = self
                .next_connection
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let id = *next;
            *next += 1;
            id
        };
        let (online, _) = watch::channel(true);
        info!(connection = id, "memory remote connected");
        MemoryRemote {
            id,
            state: self.state.clone(),
            online,
            on_disconnect: Mutex::new(Vec::new()),
        }
    }

    /// Server-side read that bypasses connectivity.
    pub fn value_at(&self, p: &str) -> Option<Value> {
        let segs = owned_segments(p).ok()?;
        node_at(&lock(&self.state).tree, &segs).cloned()
    }

    /// Server-side write used to seed fixtures. Listeners are notified, the
    /// write log is not touched.
    pub fn seed(&self, p: &str, value: Value) -> Result<()> {
        let segs = owned_segments(p)?;
        lock(&self.state).commit(vec![(segs, value)]);
        Ok(())
    }

    pub fn write_log(&self) -> Vec<WriteRecord> {
        lock(&self.state).write_log.clone()
    }

    pub fn clear_write_log(&self) {
        lock(&self.state).write_log.clear();
    }

    /// Child range reads issued at or below `prefix`.
    pub fn query_log(&self, prefix: &str) -> Vec<QueryRecord> {
        lock(&self.state)
            .query_log
            .iter()
            .filter(|q| q.path.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Reject the next write at or below `prefix`.
    pub fn fail_next_write(&self, prefix: &str) -> Result<()> {
        let segs = owned_segments(prefix)?;
        lock(&self.state).failures.push(segs);
        Ok(())
    }

    /// Paths of live subscriptions starting with `prefix`, one entry per
    /// subscription (duplicates show up twice).
    pub fn live_subscriptions(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.state)
            .listeners
            .values()
            .map(|l| l.path.join("/"))
            .filter(|p| p.starts_with(prefix))
            .collect();
        paths.sort();
        paths
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// MemoryRemote
// ---------------------------------------------------------------------------

/// One client's connection to a [`MemoryBackend`].
pub struct MemoryRemote {
    id: u64,
    state: Arc<Mutex<BackendState>>,
    online: watch::Sender<bool>,
    on_disconnect: Mutex<Vec<(Vec<String>, Value)>>,
}

impl MemoryRemote {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flip connectivity. Going offline fires this connection's
    /// on-disconnect rules exactly once.
    pub fn set_connected(&self, connected: bool) {
        let was = *self.online.borrow();
        if was && !connected {
            let rules: Vec<(Vec<String>, Value)> = std::mem::take(
                &mut *self
                    .on_disconnect
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            let mut state = lock(&self.state);
            for (segs, value) in rules {
                let p = segs.join("/");
                state.write_log.push(WriteRecord {
                    kind: WriteKind::OnDisconnect,
                    touched: vec![p.clone()],
                    path: p,
                    connection: self.id,
                });
                state.commit(vec![(segs, value)]);
            }
        }
        if was != connected {
            info!(connection = self.id, connected, "memory remote connectivity changed");
        }
        self.online.send_replace(connected);
    }

    fn ensure_online(&self) -> Result<()> {
        if *self.online.borrow() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable)
        }
    }

    fn check_write(
        &self,
        state: &mut BackendState,
        op: &'static str,
        segs: &[String],
    ) -> Result<()> {
        if state.take_failure(segs) {
            debug!(connection = self.id, op, path = %segs.join("/"), "injected write failure");
            return Err(RemoteError::Rejected {
                op,
                path: segs.join("/"),
            });
        }
        Ok(())
    }

    fn log(&self, state: &mut BackendState, kind: WriteKind, p: &str, writes: &[(Vec<String>, Value)]) {
        state.write_log.push(WriteRecord {
            kind,
            path: p.to_string(),
            touched: writes.iter().map(|(segs, _)| segs.join("/")).collect(),
            connection: self.id,
        });
    }

    fn unsubscribe_fn(&self, id: u64) -> impl FnOnce() + Send + Sync + 'static {
        let state: Weak<Mutex<BackendState>> = Arc::downgrade(&self.state);
        move || {
            if let Some(state) = state.upgrade() {
                lock(&state).listeners.remove(&id);
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, p: &str) -> Result<Option<Value>> {
        self.ensure_online()?;
        let segs = owned_segments(p)?;
        Ok(node_at(&lock(&self.state).tree, &segs).cloned())
    }

    async fn query_children(&self, p: &str, query: ChildQuery) -> Result<Vec<(String, Value)>> {
        self.ensure_online()?;
        let segs = owned_segments(p)?;
        let mut state = lock(&self.state);
        let mut items: Vec<(String, Value)> = children(node_at(&state.tree, &segs))
            .into_iter()
            .filter(|(k, _)| query.start_at.as_deref().map_or(true, |start| *k >= start))
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        if let Some(n) = query.limit_to_last {
            let skip = items.len().saturating_sub(n);
            items.drain(..skip);
        }
        state.query_log.push(QueryRecord {
            path: p.to_string(),
            returned: items.len(),
            query,
            connection: self.id,
        });
        Ok(items)
    }

    async fn set(&self, p: &str, value: Value) -> Result<()> {
        self.ensure_online()?;
        let segs = owned_segments(p)?;
        let mut state = lock(&self.state);
        self.check_write(&mut state, "set", &segs)?;
        let writes = vec![(segs, value)];
        self.log(&mut state, WriteKind::Set, p, &writes);
        state.commit(writes);
        debug!(connection = self.id, path = %p, "set");
        Ok(())
    }

    async fn update(&self, p: &str, patch: Map<String, Value>) -> Result<()> {
        self.ensure_online()?;
        let mut writes = Vec::with_capacity(patch.len());
        for (rel, value) in patch {
            writes.push((owned_segments(&path::join(p, &rel))?, value));
        }
        let mut state = lock(&self.state);
        for (segs, _) in &writes {
            self.check_write(&mut state, "update", segs)?;
        }
        self.log(&mut state, WriteKind::Update, p, &writes);
        state.commit(writes);
        debug!(connection = self.id, path = %p, "update");
        Ok(())
    }

    async fn transaction(&self, p: &str, mut apply: TransactionFn) -> Result<Option<Value>> {
        self.ensure_online()?;
        let segs = owned_segments(p)?;
        let mut state = lock(&self.state);
        let current = node_at(&state.tree, &segs).cloned();
        let Some(next) = apply(current) else {
            debug!(connection = self.id, path = %p, "transaction aborted");
            return Ok(None);
        };
        self.check_write(&mut state, "transaction", &segs)?;
        let writes = vec![(segs.clone(), next)];
        self.log(&mut state, WriteKind::Transaction, p, &writes);
        state.commit(writes);
        Ok(Some(node_at(&state.tree, &segs).cloned().unwrap_or(Value::Null)))
    }

    async fn on_disconnect_set(&self, p: &str, value: Value) -> Result<()> {
        self.ensure_online()?;
        let segs = owned_segments(p)?;
        let mut rules = self
            .on_disconnect
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rules.retain(|(existing, _)| existing != &segs);
        rules.push((segs, value));
        Ok(())
    }

    fn subscribe_children(&self, p: &str) -> Result<Subscription<ChildEvent>> {
        let segs = owned_segments(p)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = lock(&self.state).register(segs, Sink::Children(tx));
        debug!(connection = self.id, path = %p, id, "child subscription started");
        Ok(Subscription::new(rx, SubscriptionHandle::new(self.unsubscribe_fn(id))))
    }

    fn subscribe_value(&self, p: &str) -> Result<Subscription<Option<Value>>> {
        let segs = owned_segments(p)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            let _ = tx.send(node_at(&state.tree, &segs).cloned());
            state.register(segs, Sink::Value(tx))
        };
        debug!(connection = self.id, path = %p, id, "value subscription started");
        Ok(Subscription::new(rx, SubscriptionHandle::new(self.unsubscribe_fn(id))))
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}
