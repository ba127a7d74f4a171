//! Conversation list: the per-user room index joined with room details.
//!
//! The published list is always sorted by last message time, newest first.
//! Rooms opened locally that have no server metadata yet are kept until the
//! index catches up with them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_remote::{path, ChildEvent, ChildEventKind, TransactionFn};
use parley_shared::protocol::{millis_to_datetime, ChatMeta, GroupRecord};
use parley_shared::{sort_conversations, Conversation, RoomId, RoomKind, UserId};

use crate::context::Shared;
use crate::error::{Result, SyncError};
use crate::listener::Listener;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Room details that do not live in the per-user index.
#[derive(Debug, Clone)]
struct RoomDetail {
    kind: RoomKind,
    title: String,
    avatar: Option<String>,
    members: BTreeSet<UserId>,
    admin_ids: BTreeSet<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    Archived,
    Pinned,
    Locked,
}

impl Flag {
    fn set_meta(self, meta: &mut ChatMeta, value: bool) {
        match self {
            Flag::Archived => meta.is_archived = value,
            Flag::Pinned => meta.is_pinned = value,
            Flag::Locked => meta.is_locked = value,
        }
    }

    fn set_conversation(self, conversation: &mut Conversation, value: bool) {
        match self {
            Flag::Archived => conversation.is_archived = value,
            Flag::Pinned => conversation.is_pinned = value,
            Flag::Locked => conversation.is_locked = value,
        }
    }
}

pub struct ConversationEngine {
    shared: Arc<Shared>,
    list: watch::Sender<Vec<Conversation>>,
    details: Mutex<HashMap<RoomId, RoomDetail>>,
    /// Rooms synthesized locally that are not in the index yet.
    local_only: Mutex<HashSet<RoomId>>,
    index: Mutex<Option<Listener>>,
}

impl ConversationEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let (list, _) = watch::channel(Vec::new());
        Self {
            shared,
            list,
            details: Mutex::new(HashMap::new()),
            local_only: Mutex::new(HashSet::new()),
            index: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Conversation>> {
        self.list.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.list.borrow().clone()
    }

    pub fn conversation(&self, room: &RoomId) -> Option<Conversation> {
        self.list
            .borrow()
            .iter()
            .find(|c| &c.room_id == room)
            .cloned()
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.index).is_some()
    }

    // ---------------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------------

    /// Publish the cached list, then reconcile it with the remote index.
    ///
    /// Rooms whose details fail to resolve are skipped for this pass and
    /// keep their previous entry. On the first call a single live listener
    /// on the index is attached; later calls reuse it.
    pub async fn load(self: &Arc<Self>) -> Result<Vec<Conversation>> {
        let me = self.shared.me.clone();

        let showing = !self.list.borrow().is_empty();
        match self.shared.cache.conversations(&me) {
            Ok(cached) if !cached.is_empty() && !showing => {
                debug!(count = cached.len(), "publishing cached conversations");
                self.publish(|list| {
                    *list = cached;
                    true
                });
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cached conversations unreadable"),
        }

        // Subscribe before reading so nothing written in between is missed.
        let pending = if self.is_listening() {
            None
        } else {
            Some(
                self.shared
                    .remote
                    .subscribe_children(&path::user_rooms(&me))?
                    .into_parts(),
            )
        };

        let entries: Vec<(RoomId, Value)> =
            match self.shared.remote.get(&path::user_rooms(&me)).await? {
                Some(Value::Object(map)) => map.into_iter().map(|(k, v)| (RoomId(k), v)).collect(),
                Some(other) => {
                    warn!(value = %other, "room index is not an object, treating as empty");
                    Vec::new()
                }
                None => Vec::new(),
            };

        let resolved = join_all(
            entries
                .iter()
                .map(|(room, value)| self.resolve(room, value.clone(), false)),
        )
        .await;

        let indexed: HashSet<RoomId> = entries.iter().map(|(room, _)| room.clone()).collect();
        let mut fresh = Vec::with_capacity(entries.len());
        for ((room, _), result) in entries.iter().zip(resolved) {
            match result {
                Ok(conversation) => fresh.push(conversation),
                Err(e) => warn!(room = %room, error = %e, "skipping room for this pass"),
            }
        }

        for conversation in &fresh {
            if let Err(e) = self.shared.cache.save_conversation(&me, conversation).await {
                warn!(room = %conversation.room_id, error = %e, "conversation not cached");
            }
        }

        let local_only = {
            let mut local_only = lock(&self.local_only);
            local_only.retain(|room| !indexed.contains(room));
            local_only.clone()
        };
        let gone: Vec<RoomId> = self
            .list
            .borrow()
            .iter()
            .filter(|c| !indexed.contains(&c.room_id) && !local_only.contains(&c.room_id))
            .map(|c| c.room_id.clone())
            .collect();
        for room in &gone {
            self.forget(room);
        }

        self.publish(|list| {
            for conversation in fresh {
                upsert(list, conversation);
            }
            true
        });

        if let Some((events, handle)) = pending {
            let task = self.spawn_index_task(events);
            let previous = lock(&self.index).replace(Listener::new(handle, task));
            drop(previous);
        }

        info!(rooms = indexed.len(), removed = gone.len(), "conversations loaded");
        Ok(self.snapshot())
    }

    fn spawn_index_task(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<ChildEvent>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.apply_index_event(event).await;
            }
        })
    }

    async fn apply_index_event(&self, event: ChildEvent) {
        let room = RoomId(event.key);
        match event.kind {
            ChildEventKind::Added | ChildEventKind::Changed => {
                let reuse = lock(&self.details).contains_key(&room);
                match self.resolve(&room, event.value, reuse).await {
                    Ok(conversation) => {
                        lock(&self.local_only).remove(&room);
                        if let Err(e) = self
                            .shared
                            .cache
                            .save_conversation(&self.shared.me, &conversation)
                            .await
                        {
                            warn!(room = %room, error = %e, "conversation not cached");
                        }
                        self.publish(|list| {
                            upsert(list, conversation);
                            true
                        });
                    }
                    Err(e) => warn!(room = %room, error = %e, "live room update skipped"),
                }
            }
            ChildEventKind::Removed => {
                debug!(room = %room, "room left the index");
                self.forget(&room);
            }
        }
    }

    /// Stop following the index. The published list is kept.
    pub fn detach(&self) {
        lock(&self.index).take();
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    async fn resolve(&self, room: &RoomId, value: Value, reuse_detail: bool) -> Result<Conversation> {
        let meta = ChatMeta::from_value(value)?;

        let cached = if reuse_detail {
            lock(&self.details).get(room).cloned()
        } else {
            None
        };
        let detail = match cached {
            Some(detail) => detail,
            None => {
                let detail = self.fetch_detail(room, meta.kind).await?;
                lock(&self.details).insert(room.clone(), detail.clone());
                detail
            }
        };

        let last_message = match &meta.last_message {
            Some(ciphertext) => Some(self.shared.decrypt_or_fallback(room, ciphertext).await),
            None => None,
        };
        let now = Utc::now();
        let created_at = self
            .conversation(room)
            .map(|c| c.created_at)
            .unwrap_or(now);

        Ok(Conversation {
            room_id: room.clone(),
            kind: detail.kind,
            title: detail.title,
            avatar: detail.avatar,
            members: detail.members,
            admin_ids: detail.admin_ids,
            last_message,
            last_message_type: meta.last_message_type,
            last_message_at: meta.last_message_at.and_then(millis_to_datetime),
            unread_count: meta.unread_count,
            is_archived: meta.is_archived,
            is_pinned: meta.is_pinned,
            is_locked: meta.is_locked,
            created_at,
            updated_at: now,
        })
    }

    async fn fetch_detail(&self, room: &RoomId, kind: RoomKind) -> Result<RoomDetail> {
        let me = &self.shared.me;
        if kind == RoomKind::Private {
            let peer = room
                .peer_of(me)
                .ok_or_else(|| SyncError::NotFound(format!("peer of private room {room}")))?;
            let (title, avatar) = self.peer_title(&peer).await;
            return Ok(RoomDetail {
                kind,
                title,
                avatar,
                members: BTreeSet::from([me.clone(), peer]),
                admin_ids: BTreeSet::new(),
            });
        }

        let value = self
            .shared
            .remote
            .get(&path::group_room(room))
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("group record {room}")))?;
        let record = GroupRecord::from_value(value)?;
        let members = record.member_ids();
        let title = if record.title.is_empty() {
            room.to_string()
        } else {
            record.title
        };
        Ok(RoomDetail {
            kind: record.kind.unwrap_or(kind),
            title,
            avatar: record.avatar,
            members,
            admin_ids: record.admin_ids.into_iter().collect(),
        })
    }

    /// Display name and avatar of a peer: local contact first, then the
    /// profile service, then the phone number, then the raw id.
    async fn peer_title(&self, peer: &UserId) -> (String, Option<String>) {
        let contact = match self.shared.cache.with_db(|db| db.get_contact(peer)) {
            Ok(contact) => contact,
            Err(e) => {
                warn!(peer = %peer, error = %e, "contact lookup failed");
                None
            }
        };
        if let Some(contact) = &contact {
            if let Some(name) = contact.display_name.as_ref().filter(|n| !n.is_empty()) {
                return (name.clone(), contact.avatar.clone());
            }
        }

        let profile = match self.shared.caps.profiles.profile(peer).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(peer = %peer, error = %e, "profile lookup failed");
                None
            }
        };
        let avatar = contact
            .as_ref()
            .and_then(|c| c.avatar.clone())
            .or_else(|| profile.as_ref().and_then(|p| p.avatar.clone()));
        if let Some(name) = profile
            .as_ref()
            .and_then(|p| p.name.clone())
            .filter(|n| !n.is_empty())
        {
            return (name, avatar);
        }
        let phone = contact
            .and_then(|c| c.phone)
            .or_else(|| profile.and_then(|p| p.phone))
            .filter(|p| !p.is_empty());
        (phone.unwrap_or_else(|| peer.to_string()), avatar)
    }

    // ---------------------------------------------------------------------
    // Queries used by the other engines
    // ---------------------------------------------------------------------

    /// Members of `room`, from the list if known, else from the room id or
    /// the group record.
    pub async fn members_of(&self, room: &RoomId) -> Result<BTreeSet<UserId>> {
        if let Some(members) = self
            .conversation(room)
            .map(|c| c.members)
            .filter(|m| !m.is_empty())
        {
            return Ok(members);
        }
        if let Some(detail) = lock(&self.details).get(room) {
            return Ok(detail.members.clone());
        }
        if let Some(peer) = room.peer_of(&self.shared.me) {
            return Ok(BTreeSet::from([self.shared.me.clone(), peer]));
        }
        match self.shared.remote.get(&path::group_room(room)).await? {
            Some(value) => Ok(GroupRecord::from_value(value)?.member_ids()),
            None => Err(SyncError::NotFound(format!("group record {room}"))),
        }
    }

    pub fn kind_of(&self, room: &RoomId) -> RoomKind {
        if let Some(conversation) = self.conversation(room) {
            return conversation.kind;
        }
        if let Some(detail) = lock(&self.details).get(room) {
            return detail.kind;
        }
        if room.peer_of(&self.shared.me).is_some() {
            RoomKind::Private
        } else {
            RoomKind::Group
        }
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Open (or create locally) the 1:1 room with `peer`. The room shows up
    /// in the list right away; server metadata is created by the first send.
    pub async fn open_private_chat(&self, peer: &UserId) -> Result<Conversation> {
        let me = &self.shared.me;
        if peer == me || !path::is_valid_key(peer.as_str()) {
            return Err(SyncError::Validation(format!("cannot open a chat with '{peer}'")));
        }
        let room = RoomId::private(me, peer);
        if let Some(existing) = self.conversation(&room) {
            return Ok(existing);
        }

        let (title, avatar) = self.peer_title(peer).await;
        let members = BTreeSet::from([me.clone(), peer.clone()]);
        let mut conversation = Conversation::synthesized(room.clone(), RoomKind::Private, title.clone());
        conversation.avatar = avatar.clone();
        conversation.members = members.clone();

        lock(&self.details).insert(
            room.clone(),
            RoomDetail {
                kind: RoomKind::Private,
                title,
                avatar,
                members,
                admin_ids: BTreeSet::new(),
            },
        );
        lock(&self.local_only).insert(room.clone());
        if let Err(e) = self.shared.cache.save_conversation(me, &conversation).await {
            warn!(room = %room, error = %e, "conversation not cached");
        }
        self.publish(|list| {
            upsert(list, conversation.clone());
            true
        });
        info!(room = %room, "private chat opened locally");
        Ok(conversation)
    }

    pub async fn set_archived(&self, room: &RoomId, archived: bool) -> Result<()> {
        self.set_flag(room, Flag::Archived, archived).await
    }

    pub async fn set_pinned(&self, room: &RoomId, pinned: bool) -> Result<()> {
        self.set_flag(room, Flag::Pinned, pinned).await
    }

    pub async fn set_locked(&self, room: &RoomId, locked: bool) -> Result<()> {
        self.set_flag(room, Flag::Locked, locked).await
    }

    async fn set_flag(&self, room: &RoomId, flag: Flag, value: bool) -> Result<()> {
        let apply: TransactionFn = Box::new(move |current| {
            let mut meta = ChatMeta::from_value(current?).ok()?;
            flag.set_meta(&mut meta, value);
            meta.to_value().ok()
        });
        let committed = self
            .shared
            .remote
            .transaction(&path::user_room(&self.shared.me, room), apply)
            .await?;
        if committed.is_none() {
            debug!(room = %room, ?flag, "no chat metadata yet, flag kept locally");
        }
        self.patch_local(room, |c| flag.set_conversation(c, value)).await;
        Ok(())
    }

    /// Apply `f` to the published entry of `room` and to its cached copy.
    pub(crate) async fn patch_local(&self, room: &RoomId, f: impl Fn(&mut Conversation) + Send + Sync) {
        self.publish(|list| match list.iter_mut().find(|c| &c.room_id == room) {
            Some(conversation) => {
                f(conversation);
                true
            }
            None => false,
        });
        let result = self
            .shared
            .cache
            .update_conversation(&self.shared.me, room, |current| {
                current.map(|mut c| {
                    f(&mut c);
                    c
                })
            })
            .await;
        if let Err(e) = result {
            warn!(room = %room, error = %e, "cached conversation not updated");
        }
    }

    /// Remove `room` from this user's index and from the list.
    pub async fn remove_room(&self, room: &RoomId) -> Result<()> {
        self.shared
            .remote
            .remove(&path::user_room(&self.shared.me, room))
            .await?;
        self.forget(room);
        Ok(())
    }

    fn forget(&self, room: &RoomId) {
        lock(&self.details).remove(room);
        lock(&self.local_only).remove(room);
        self.publish(|list| {
            let before = list.len();
            list.retain(|c| &c.room_id != room);
            list.len() != before
        });
        if let Err(e) = self.shared.cache.delete_conversation(&self.shared.me, room) {
            warn!(room = %room, error = %e, "cached conversation not deleted");
        }
    }

    fn publish(&self, f: impl FnOnce(&mut Vec<Conversation>) -> bool) {
        self.list.send_if_modified(|list| {
            let changed = f(list);
            if changed {
                sort_conversations(list);
            }
            changed
        });
    }
}

fn upsert(list: &mut Vec<Conversation>, conversation: Conversation) {
    match list.iter_mut().find(|c| c.room_id == conversation.room_id) {
        Some(existing) => *existing = conversation,
        None => list.push(conversation),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use parley_remote::{MemoryBackend, RemoteStore};
    use parley_shared::crypto::RoomKeyCipher;
    use parley_shared::{Contact, Profile};
    use serde_json::json;

    use super::*;
    use crate::test_support::{harness, Harness, MASTER};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn seal(room: &str, text: &str) -> String {
        RoomKeyCipher::new(MASTER)
            .encrypt_text(&RoomId::from(room), text)
            .unwrap()
    }

    fn engine(h: &Harness) -> Arc<ConversationEngine> {
        Arc::new(ConversationEngine::new(h.shared.clone()))
    }

    fn order(list: &[Conversation]) -> Vec<&str> {
        list.iter().map(|c| c.room_id.as_str()).collect()
    }

    #[tokio::test]
    async fn load_resolves_and_sorts() {
        let backend = MemoryBackend::new();
        backend.seed(
            "userRooms/alice",
            json!({
                "alicebob": {"type": "private", "lastmessage": seal("alicebob", "hey"), "lastmessageAt": 10},
                "alicecarol": {"type": "private", "lastmessageAt": 30},
                "g1": {"type": "group", "lastMessageAt": 20, "unread": 2},
            }),
        ).unwrap();
        backend.seed(
            "rooms_group/g1",
            json!({"name": "climbers", "members": ["alice", "bob", "dave"]}),
        ).unwrap();
        let h = harness(&backend, "alice");
        h.profiles.insert(
            "bob",
            Profile {
                name: Some("Bob".into()),
                ..Profile::default()
            },
        );

        let conversations = engine(&h);
        let list = conversations.load().await.unwrap();

        assert_eq!(order(&list), vec!["alicecarol", "g1", "alicebob"]);
        let bob = &list[2];
        assert_eq!(bob.title, "Bob");
        assert_eq!(bob.last_message.as_deref(), Some("hey"));
        assert_eq!(list[0].title, "carol");
        assert_eq!(list[1].title, "climbers");
        assert_eq!(list[1].unread_count, 2);
        assert_eq!(list[1].members.len(), 3);
        assert!(conversations.is_listening());
    }

    #[tokio::test]
    async fn contact_name_wins_over_profile() {
        let backend = MemoryBackend::new();
        backend.seed("userRooms/alice/alicebob", json!({"type": "private"})).unwrap();
        let h = harness(&backend, "alice");
        h.shared
            .cache
            .with_db(|db| {
                db.upsert_contact(&Contact {
                    user_id: UserId::from("bob"),
                    display_name: Some("Bobby".into()),
                    phone: None,
                    avatar: None,
                })
            })
            .unwrap();
        h.profiles.fail.store(true, Ordering::SeqCst);

        let list = engine(&h).load().await.unwrap();
        assert_eq!(list[0].title, "Bobby");
    }

    #[tokio::test]
    async fn unresolvable_room_is_skipped() {
        let backend = MemoryBackend::new();
        backend.seed(
            "userRooms/alice",
            json!({
                "alicebob": {"type": "private", "lastmessageAt": 1},
                "ghost": {"type": "group", "lastmessageAt": 2},
            }),
        ).unwrap();
        let h = harness(&backend, "alice");

        let list = engine(&h).load().await.unwrap();
        assert_eq!(order(&list), vec!["alicebob"]);
    }

    #[tokio::test]
    async fn rooms_removed_remotely_are_dropped_but_local_ones_kept() {
        let backend = MemoryBackend::new();
        backend.seed("userRooms/alice/alicebob", json!({"type": "private"})).unwrap();
        let h = harness(&backend, "alice");
        let conversations = engine(&h);
        conversations.load().await.unwrap();

        let local = conversations
            .open_private_chat(&UserId::from("zed"))
            .await
            .unwrap();
        assert_eq!(local.room_id, RoomId::from("alicezed"));

        backend.seed("userRooms/alice/alicebob", Value::Null).unwrap();
        settle().await;
        let list = conversations.load().await.unwrap();
        assert_eq!(order(&list), vec!["alicezed"]);
        assert!(h
            .shared
            .cache
            .conversations(&UserId::from("alice"))
            .unwrap()
            .iter()
            .all(|c| c.room_id.as_str() != "alicebob"));
    }

    #[tokio::test]
    async fn live_index_updates_one_room() {
        let backend = MemoryBackend::new();
        backend.seed("userRooms/alice/alicebob", json!({"type": "private", "lastmessageAt": 1})).unwrap();
        let h = harness(&backend, "alice");
        let conversations = engine(&h);
        conversations.load().await.unwrap();
        let mut rx = conversations.subscribe();
        rx.borrow_and_update();

        let other = backend.connect();
        other
            .set(
                "userRooms/alice/alicecarol",
                json!({"type": "private", "lastmessageAt": 5, "unreadCount": 1}),
            )
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(order(&rx.borrow_and_update()), vec!["alicecarol", "alicebob"]);

        other
            .set("userRooms/alice/alicebob/lastmessageAt", json!(9))
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(order(&rx.borrow_and_update()), vec!["alicebob", "alicecarol"]);

        other.remove("userRooms/alice/alicecarol").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(order(&rx.borrow()), vec!["alicebob"]);
    }

    #[tokio::test]
    async fn repeated_load_keeps_one_listener() {
        let backend = MemoryBackend::new();
        backend.seed("userRooms/alice/alicebob", json!({"type": "private"})).unwrap();
        let h = harness(&backend, "alice");
        let conversations = engine(&h);
        conversations.load().await.unwrap();
        conversations.load().await.unwrap();
        assert_eq!(backend.live_subscriptions("userRooms/"), vec!["userRooms/alice"]);
    }

    #[tokio::test]
    async fn failed_index_read_keeps_cached_list() {
        let backend = MemoryBackend::new();
        backend.seed("userRooms/alice/alicebob", json!({"type": "private", "lastmessageAt": 3})).unwrap();
        let h = harness(&backend, "alice");
        engine(&h).load().await.unwrap();

        let fresh = engine(&h);
        h.remote.set_connected(false);
        assert!(fresh.load().await.is_err());
        assert_eq!(order(&fresh.snapshot()), vec!["alicebob"]);
    }

    #[tokio::test]
    async fn flags_write_through() {
        let backend = MemoryBackend::new();
        backend.seed("userRooms/alice/alicebob", json!({"type": "private"})).unwrap();
        let h = harness(&backend, "alice");
        let conversations = engine(&h);
        conversations.load().await.unwrap();

        let room = RoomId::from("alicebob");
        conversations.set_pinned(&room, true).await.unwrap();
        conversations.set_archived(&room, true).await.unwrap();

        assert_eq!(backend.value_at("userRooms/alice/alicebob/isPinned"), Some(json!(true)));
        assert_eq!(backend.value_at("userRooms/alice/alicebob/isArchived"), Some(json!(true)));
        let local = conversations.conversation(&room).unwrap();
        assert!(local.is_pinned && local.is_archived && !local.is_locked);
    }

    #[tokio::test]
    async fn members_fall_back_to_room_id() {
        let backend = MemoryBackend::new();
        let h = harness(&backend, "alice");
        let conversations = engine(&h);
        let members = conversations
            .members_of(&RoomId::from("alicebob"))
            .await
            .unwrap();
        assert_eq!(members, BTreeSet::from([UserId::from("alice"), UserId::from("bob")]));
        assert_eq!(conversations.kind_of(&RoomId::from("g9")), RoomKind::Group);
    }

    #[tokio::test]
    async fn group_roster_keeps_active_members_only() {
        let backend = MemoryBackend::new();
        backend
            .seed(
                "rooms_group/g2",
                json!({
                    "title": "crew",
                    "members": {
                        "alice": {"username": "alice", "isActive": true},
                        "bob": {"phone": "+1555", "isActive": true},
                        "carol": {},
                        "dave": {"username": "dave", "isActive": false},
                    },
                    "adminIds": {"alice": true},
                }),
            )
            .unwrap();
        let h = harness(&backend, "alice");
        let conversations = engine(&h);
        let room = RoomId::from("g2");
        let active = BTreeSet::from([
            UserId::from("alice"),
            UserId::from("bob"),
            UserId::from("carol"),
        ]);

        // Before any load the roster is read straight from the group record.
        assert_eq!(conversations.members_of(&room).await.unwrap(), active);

        backend
            .seed("userRooms/alice/g2", json!({"type": "group", "lastmessageAt": 5}))
            .unwrap();
        let list = conversations.load().await.unwrap();
        assert_eq!(list[0].title, "crew");
        assert_eq!(list[0].members, active);
        assert_eq!(list[0].admin_ids, BTreeSet::from([UserId::from("alice")]));
        assert_eq!(conversations.members_of(&room).await.unwrap(), active);
    }
}
