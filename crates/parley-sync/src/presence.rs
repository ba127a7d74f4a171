//! Presence and typing tracker.
//!
//! Exactly one live subscription exists per tracked user. [`PresenceTracker::track`]
//! replaces the tracked set as a whole: ids that left the set are
//! unsubscribed, new ids are subscribed, ids in both keep their existing
//! subscription.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_remote::{path, ChildEvent, ChildEventKind};
use parley_shared::protocol::{now_millis, PresenceWire};
use parley_shared::{PresenceRecord, RoomId, UserId};

use crate::context::Shared;
use crate::error::Result;
use crate::listener::Listener;

pub type PresenceMap = HashMap<UserId, PresenceRecord>;
pub type TypingMap = HashMap<RoomId, BTreeSet<UserId>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returned by [`PresenceTracker::track`]. Stopping it releases the tracked
/// set, unless a later `track` call already replaced it.
#[must_use = "call stop() to release the tracked subscriptions"]
#[derive(Debug)]
pub struct TrackHandle {
    tracker: Weak<PresenceTracker>,
    generation: u64,
}

impl TrackHandle {
    pub fn stop(self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.release(self.generation);
        }
    }
}

pub struct PresenceTracker {
    shared: Arc<Shared>,
    presence: watch::Sender<PresenceMap>,
    typing: watch::Sender<TypingMap>,
    tracked: Mutex<HashMap<UserId, Listener>>,
    generation: AtomicU64,
    typing_listeners: Mutex<HashMap<RoomId, Listener>>,
    typing_timers: Mutex<HashMap<RoomId, (u64, JoinHandle<()>)>>,
    timer_seq: AtomicU64,
}

impl PresenceTracker {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let (presence, _) = watch::channel(PresenceMap::new());
        let (typing, _) = watch::channel(TypingMap::new());
        Self {
            shared,
            presence,
            typing,
            tracked: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            typing_listeners: Mutex::new(HashMap::new()),
            typing_timers: Mutex::new(HashMap::new()),
            timer_seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceMap> {
        self.presence.subscribe()
    }

    pub fn subscribe_typing(&self) -> watch::Receiver<TypingMap> {
        self.typing.subscribe()
    }

    pub fn presence_of(&self, user: &UserId) -> Option<PresenceRecord> {
        self.presence.borrow().get(user).cloned()
    }

    pub fn typing_in(&self, room: &RoomId) -> BTreeSet<UserId> {
        self.typing.borrow().get(room).cloned().unwrap_or_default()
    }

    pub fn tracked_ids(&self) -> BTreeSet<UserId> {
        lock(&self.tracked).keys().cloned().collect()
    }

    // ---------------------------------------------------------------------
    // Presence of others
    // ---------------------------------------------------------------------

    /// Make `ids` the exact set of users whose presence is followed.
    pub fn track(self: &Arc<Self>, ids: impl IntoIterator<Item = UserId>) -> Result<TrackHandle> {
        let wanted: BTreeSet<UserId> = ids.into_iter().collect();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut tracked = lock(&self.tracked);
        tracked.retain(|id, _| wanted.contains(id));
        for id in &wanted {
            if tracked.contains_key(id) {
                continue;
            }
            let subscription = self.shared.remote.subscribe_value(&path::presence(id))?;
            let (events, handle) = subscription.into_parts();
            let task = self.spawn_presence_task(id.clone(), events);
            tracked.insert(id.clone(), Listener::new(handle, task));
        }
        drop(tracked);

        self.presence.send_if_modified(|map| {
            let before = map.len();
            map.retain(|id, _| wanted.contains(id));
            map.len() != before
        });
        debug!(count = wanted.len(), generation, "presence tracking updated");

        Ok(TrackHandle {
            tracker: Arc::downgrade(self),
            generation,
        })
    }

    fn release(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        lock(&self.tracked).clear();
        self.presence.send_if_modified(|map| {
            let changed = !map.is_empty();
            map.clear();
            changed
        });
    }

    fn spawn_presence_task(
        self: &Arc<Self>,
        user: UserId,
        mut events: mpsc::UnboundedReceiver<Option<Value>>,
    ) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(value) = events.recv().await {
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.apply_presence(&user, value);
            }
        })
    }

    fn apply_presence(&self, user: &UserId, value: Option<Value>) {
        if !lock(&self.tracked).contains_key(user) {
            return;
        }
        let mut record = match value {
            None => PresenceRecord {
                user_id: user.clone(),
                ..PresenceRecord::default()
            },
            Some(raw) => match PresenceWire::from_value(raw) {
                Ok(wire) => wire.into_record(user.clone()),
                Err(e) => {
                    warn!(user = %user, error = %e, "ignoring malformed presence record");
                    return;
                }
            },
        };
        record.is_typing = self.is_typing_anywhere(user);
        self.presence.send_modify(|map| {
            map.insert(user.clone(), record);
        });
    }

    // ---------------------------------------------------------------------
    // Own presence
    // ---------------------------------------------------------------------

    /// Publish this user's presence. Going online first arms the server-side
    /// rule that marks us offline on an abrupt disconnect.
    pub async fn set_own_presence(&self, online: bool) -> Result<()> {
        let remote = &self.shared.remote;
        let own = path::presence(&self.shared.me);
        let now = now_millis();

        if online {
            remote
                .on_disconnect_set(&own, PresenceWire::offline(now).to_value()?)
                .await?;
            remote.set(&own, PresenceWire::online(now).to_value()?).await?;
        } else {
            remote.set(&own, PresenceWire::offline(now).to_value()?).await?;
        }
        info!(online, "own presence published");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Typing
    // ---------------------------------------------------------------------

    /// Write or clear this user's typing flag in `room`. A set flag clears
    /// itself after the configured timeout unless refreshed or cleared.
    pub async fn set_typing(self: &Arc<Self>, room: &RoomId, is_typing: bool) -> Result<()> {
        if let Some((_, timer)) = lock(&self.typing_timers).remove(room) {
            timer.abort();
        }

        let remote = &self.shared.remote;
        let flag = path::typing(room, &self.shared.me);
        if !is_typing {
            remote.remove(&flag).await?;
            return Ok(());
        }

        remote.on_disconnect_set(&flag, Value::Null).await?;
        remote.set(&flag, Value::Bool(true)).await?;

        let id = self.timer_seq.fetch_add(1, Ordering::SeqCst);
        let timeout = self.shared.config.typing_timeout;
        let tracker = Arc::downgrade(self);
        let timer_room = room.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.expire_typing(&timer_room, id).await;
            }
        });
        lock(&self.typing_timers).insert(room.clone(), (id, timer));
        Ok(())
    }

    async fn expire_typing(&self, room: &RoomId, id: u64) {
        {
            let mut timers = lock(&self.typing_timers);
            match timers.get(room) {
                Some((current, _)) if *current == id => {
                    timers.remove(room);
                }
                _ => return,
            }
        }
        debug!(room = %room, "typing flag expired");
        if let Err(e) = self
            .shared
            .remote
            .remove(&path::typing(room, &self.shared.me))
            .await
        {
            warn!(room = %room, error = %e, "failed to clear expired typing flag");
        }
    }

    /// Follow who is typing in `room`. Idempotent.
    pub fn watch_typing(self: &Arc<Self>, room: &RoomId) -> Result<()> {
        let mut listeners = lock(&self.typing_listeners);
        if listeners.contains_key(room) {
            return Ok(());
        }
        let subscription = self
            .shared
            .remote
            .subscribe_children(&path::typing_room(room))?;
        let (mut events, handle) = subscription.into_parts();

        let tracker = Arc::downgrade(self);
        let task_room = room.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };
                tracker.apply_typing_event(&task_room, event);
            }
        });
        listeners.insert(room.clone(), Listener::new(handle, task));
        Ok(())
    }

    pub fn unwatch_typing(&self, room: &RoomId) {
        if lock(&self.typing_listeners).remove(room).is_none() {
            return;
        }
        let removed = {
            let mut removed = BTreeSet::new();
            self.typing.send_if_modified(|map| match map.remove(room) {
                Some(users) => {
                    removed = users;
                    true
                }
                None => false,
            });
            removed
        };
        for user in removed {
            self.refresh_typing_flag(&user);
        }
    }

    fn apply_typing_event(&self, room: &RoomId, event: ChildEvent) {
        if !lock(&self.typing_listeners).contains_key(room) {
            return;
        }
        let user = UserId(event.key);
        if user == self.shared.me {
            return;
        }
        let typing = event.kind != ChildEventKind::Removed && event.value.as_bool().unwrap_or(false);

        self.typing.send_if_modified(|map| {
            let users = map.entry(room.clone()).or_default();
            let changed = if typing {
                users.insert(user.clone())
            } else {
                users.remove(&user)
            };
            if users.is_empty() {
                map.remove(room);
            }
            changed
        });
        self.refresh_typing_flag(&user);
    }

    fn is_typing_anywhere(&self, user: &UserId) -> bool {
        self.typing.borrow().values().any(|users| users.contains(user))
    }

    fn refresh_typing_flag(&self, user: &UserId) {
        let typing = self.is_typing_anywhere(user);
        self.presence.send_if_modified(|map| match map.get_mut(user) {
            Some(record) if record.is_typing != typing => {
                record.is_typing = typing;
                true
            }
            _ => false,
        });
    }

    /// Drop every subscription and pending timer.
    pub(crate) fn stop_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.tracked).clear();
        lock(&self.typing_listeners).clear();
        for (_, (_, timer)) in lock(&self.typing_timers).drain() {
            timer.abort();
        }
        self.presence.send_replace(PresenceMap::new());
        self.typing.send_replace(TypingMap::new());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_remote::{MemoryBackend, RemoteStore};
    use serde_json::json;

    use super::*;
    use crate::test_support::{harness, Harness};

    fn ids(list: &[&str]) -> Vec<UserId> {
        list.iter().map(|s| UserId::from(*s)).collect()
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn tracked_subscriptions_match_latest_call() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));

        let calls = [
            ids(&["a", "b", "c"]),
            ids(&["b", "c", "d"]),
            ids(&["d", "d"]),
            ids(&[]),
            ids(&["a"]),
        ];
        for call in calls {
            let _handle = tracker.track(call.clone()).unwrap();
            let expected: BTreeSet<UserId> = call.into_iter().collect();
            assert_eq!(tracker.tracked_ids(), expected);

            let live: Vec<String> = backend.live_subscriptions("presence/");
            let expected_paths: Vec<String> =
                expected.iter().map(|id| format!("presence/{id}")).collect();
            assert_eq!(live, expected_paths);
        }
    }

    #[tokio::test]
    async fn stale_handle_does_not_release_newer_set() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));

        let old = tracker.track(ids(&["a"])).unwrap();
        let current = tracker.track(ids(&["b"])).unwrap();
        old.stop();
        assert_eq!(tracker.tracked_ids().len(), 1);

        current.stop();
        assert!(tracker.tracked_ids().is_empty());
        assert!(backend.live_subscriptions("presence/").is_empty());
    }

    #[tokio::test]
    async fn presence_updates_are_normalized() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));
        let mut rx = tracker.subscribe();

        let _handle = tracker.track(ids(&["bob"])).unwrap();
        backend
            .seed("presence/bob", json!({"state": "online", "lastSeen": 1_700_000_000_000_i64}))
            .unwrap();

        let bob = UserId::from("bob");
        let record = loop {
            rx.changed().await.unwrap();
            if let Some(r) = rx.borrow().get(&bob).filter(|r| r.is_online).cloned() {
                break r;
            }
        };
        assert_eq!(record.last_seen.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn going_online_arms_offline_rule_first() {
        let backend = MemoryBackend::new();
        let Harness { shared, remote, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));

        tracker.set_own_presence(true).await.unwrap();
        assert_eq!(backend.value_at("presence/me/isOnline"), Some(json!(true)));

        remote.set_connected(false);
        assert_eq!(backend.value_at("presence/me/isOnline"), Some(json!(false)));
    }

    #[tokio::test]
    async fn going_online_while_offline_fails_without_writing() {
        let backend = MemoryBackend::new();
        let Harness { shared, remote, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));

        remote.set_connected(false);
        assert!(tracker.set_own_presence(true).await.is_err());
        assert_eq!(backend.value_at("presence/me"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_flag_clears_itself() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));
        let room = RoomId::from("r1");

        tracker.set_typing(&room, true).await.unwrap();
        assert_eq!(backend.value_at("typing/r1/me"), Some(json!(true)));

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(backend.value_at("typing/r1/me"), Some(json!(true)));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(backend.value_at("typing/r1/me"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshing_typing_restarts_the_timeout() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));
        let room = RoomId::from("r1");

        tracker.set_typing(&room, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        tracker.set_typing(&room, true).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        settle().await;
        assert_eq!(backend.value_at("typing/r1/me"), Some(json!(true)));

        tracker.set_typing(&room, false).await.unwrap();
        assert_eq!(backend.value_at("typing/r1/me"), None);
    }

    #[tokio::test]
    async fn typing_of_others_is_published() {
        let backend = MemoryBackend::new();
        let Harness { shared, .. } = harness(&backend, "me");
        let tracker = Arc::new(PresenceTracker::new(shared));
        let room = RoomId::from("r1");
        let other = backend.connect();
        let mut rx = tracker.subscribe_typing();

        tracker.watch_typing(&room).unwrap();
        other.set("typing/r1/bob", json!(true)).await.unwrap();
        rx.changed().await.unwrap();
        assert!(tracker.typing_in(&room).contains(&UserId::from("bob")));

        other.remove("typing/r1/bob").await.unwrap();
        rx.changed().await.unwrap();
        assert!(tracker.typing_in(&room).is_empty());

        tracker.unwatch_typing(&room);
        assert!(backend.live_subscriptions("typing/").is_empty());
    }
}
