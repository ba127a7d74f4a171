//! Per-room message lists.
//!
//! Opening a room backfills from the local cache, catches up with the
//! remote store from the last processed key, then follows live changes
//! until the room is closed. Every message is persisted before it is
//! published, and a message id appears at most once in a room's list.
//! Closing a room keeps its list so reopening is cheap.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_remote::{path, ChildEvent, ChildEventKind, ChildQuery};
use parley_shared::protocol::{now_millis, MessageRecord};
use parley_shared::{
    sort_messages, ActionPayload, Attachment, Message, MsgId, RoomId, SendState, UserId,
};
use parley_store::CachedMessage;

use crate::attachments::AttachmentResolver;
use crate::context::Shared;
use crate::conversations::ConversationEngine;
use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::listener::Listener;
use crate::offline_queue::OfflineQueue;
use crate::presence::{PresenceTracker, TrackHandle};
use crate::receipts::ReceiptEngine;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RoomState {
    list: watch::Sender<Vec<Message>>,
    /// Rows of the local cache already backfilled into `list`.
    local_offset: usize,
}

impl RoomState {
    fn new() -> Self {
        let (list, _) = watch::channel(Vec::new());
        Self {
            list,
            local_offset: 0,
        }
    }
}

/// How the remote catch-up of a room fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchPlan {
    /// The whole ordered message set.
    Full,
    /// Keys from this one on, inclusive; the first result repeats it.
    From(MsgId),
}

impl FetchPlan {
    fn choose(list_empty: bool, cursor: Option<MsgId>) -> Self {
        match cursor {
            Some(cursor) if !list_empty => FetchPlan::From(cursor),
            _ => FetchPlan::Full,
        }
    }
}

pub struct MessageEngine {
    shared: Arc<Shared>,
    conversations: Arc<ConversationEngine>,
    receipts: Arc<ReceiptEngine>,
    presence: Arc<PresenceTracker>,
    attachments: Arc<AttachmentResolver>,
    queue: Arc<OfflineQueue>,
    rooms: Mutex<HashMap<RoomId, RoomState>>,
    listeners: Mutex<HashMap<RoomId, Listener>>,
    /// Members of each open room whose presence is followed.
    interest: Mutex<HashMap<RoomId, BTreeSet<UserId>>>,
    tracking: Mutex<Option<TrackHandle>>,
}

impl MessageEngine {
    pub(crate) fn new(
        shared: Arc<Shared>,
        conversations: Arc<ConversationEngine>,
        receipts: Arc<ReceiptEngine>,
        presence: Arc<PresenceTracker>,
        attachments: Arc<AttachmentResolver>,
        queue: Arc<OfflineQueue>,
    ) -> Self {
        Self {
            shared,
            conversations,
            receipts,
            presence,
            attachments,
            queue,
            rooms: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            interest: Mutex::new(HashMap::new()),
            tracking: Mutex::new(None),
        }
    }

    // ---------------------------------------------------------------------
    // Reactive lists
    // ---------------------------------------------------------------------

    /// Push stream of the sorted message list of `room`.
    pub fn subscribe_room(&self, room: &RoomId) -> watch::Receiver<Vec<Message>> {
        lock(&self.rooms)
            .entry(room.clone())
            .or_insert_with(RoomState::new)
            .list
            .subscribe()
    }

    pub fn messages(&self, room: &RoomId) -> Vec<Message> {
        lock(&self.rooms)
            .get(room)
            .map(|state| state.list.borrow().clone())
            .unwrap_or_default()
    }

    pub fn message(&self, room: &RoomId, msg: &MsgId) -> Option<Message> {
        lock(&self.rooms).get(room).and_then(|state| {
            state
                .list
                .borrow()
                .iter()
                .find(|m| &m.msg_id == msg)
                .cloned()
        })
    }

    pub fn is_open(&self, room: &RoomId) -> bool {
        lock(&self.listeners).contains_key(room)
    }

    pub fn open_rooms(&self) -> Vec<RoomId> {
        lock(&self.listeners).keys().cloned().collect()
    }

    fn is_empty(&self, room: &RoomId) -> bool {
        lock(&self.rooms)
            .get(room)
            .map_or(true, |state| state.list.borrow().is_empty())
    }

    fn contains(&self, room: &RoomId, msg: &MsgId) -> bool {
        lock(&self.rooms)
            .get(room)
            .is_some_and(|state| state.list.borrow().iter().any(|m| &m.msg_id == msg))
    }

    /// Mutate the list of `room`; subscribers are notified (once) only if
    /// `f` reports a change.
    fn publish(&self, room: &RoomId, f: impl FnOnce(&mut Vec<Message>) -> bool) -> bool {
        let mut rooms = lock(&self.rooms);
        let state = rooms.entry(room.clone()).or_insert_with(RoomState::new);
        state.list.send_if_modified(|list| {
            let changed = f(list);
            if changed {
                sort_messages(list);
            }
            changed
        })
    }

    fn patch(&self, room: &RoomId, msg: &MsgId, f: impl FnOnce(&mut Message)) {
        self.publish(room, |list| match list.iter_mut().find(|m| &m.msg_id == msg) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        });
    }

    // ---------------------------------------------------------------------
    // Open / close
    // ---------------------------------------------------------------------

    /// Open `room`: backfill, catch up, then follow live changes. Opening a
    /// room that is already open returns its list without re-attaching.
    pub async fn open_room(self: &Arc<Self>, room: &RoomId) -> Result<watch::Receiver<Vec<Message>>> {
        if self.is_open(room) {
            return Ok(self.subscribe_room(room));
        }
        info!(room = %room, "opening room");

        if let Err(e) = self.receipts.set_active_room(room).await {
            warn!(room = %room, error = %e, "active room not published");
        }
        if let Err(e) = self.presence.watch_typing(room) {
            warn!(room = %room, error = %e, "typing not watched");
        }

        if self.is_empty(room) {
            if let Err(e) = self.load_older(room).await {
                warn!(room = %room, error = %e, "local backfill failed");
            }
        }

        // Attach before the catch-up read so nothing written in between is
        // lost; duplicates are dropped by id.
        let (events, handle) = self
            .shared
            .remote
            .subscribe_children(&path::messages(room))?
            .into_parts();

        match self.catch_up(room).await {
            Ok(count) => debug!(room = %room, count, "catch-up done"),
            Err(e) => warn!(room = %room, error = %e, "catch-up failed, showing cached messages"),
        }

        let task = self.spawn_room_task(room.clone(), events);
        let previous = lock(&self.listeners).insert(room.clone(), Listener::new(handle, task));
        drop(previous);

        self.mark_room_read(room).await;

        match self.conversations.members_of(room).await {
            Ok(members) => self.update_interest(room, Some(members)),
            Err(e) => warn!(room = %room, error = %e, "room members unknown, presence not tracked"),
        }
        Ok(self.subscribe_room(room))
    }

    /// Stop following `room`. Its list is kept.
    pub async fn close_room(&self, room: &RoomId) -> Result<()> {
        let Some(listener) = lock(&self.listeners).remove(room) else {
            return Ok(());
        };
        drop(listener);
        self.presence.unwatch_typing(room);
        self.update_interest(room, None);
        self.receipts.clear_active_room(room).await?;
        info!(room = %room, "room closed");
        Ok(())
    }

    pub(crate) async fn close_all(&self) {
        for room in self.open_rooms() {
            if let Err(e) = self.close_room(&room).await {
                warn!(room = %room, error = %e, "room not closed cleanly");
            }
        }
        lock(&self.interest).clear();
        lock(&self.tracking).take();
    }

    /// Re-run the catch-up of every open room, e.g. after a reconnect.
    pub async fn catch_up_open_rooms(&self) {
        for room in self.open_rooms() {
            match self.catch_up(&room).await {
                Ok(count) => debug!(room = %room, count, "reconnect catch-up done"),
                Err(e) => warn!(room = %room, error = %e, "reconnect catch-up failed"),
            }
            self.mark_room_read(&room).await;
        }
    }

    fn update_interest(&self, room: &RoomId, members: Option<BTreeSet<UserId>>) {
        let wanted: BTreeSet<UserId> = {
            let mut interest = lock(&self.interest);
            match members {
                Some(members) => interest.insert(room.clone(), members),
                None => interest.remove(room),
            };
            interest
                .values()
                .flatten()
                .filter(|user| **user != self.shared.me)
                .cloned()
                .collect()
        };
        match self.presence.track(wanted) {
            Ok(handle) => {
                lock(&self.tracking).replace(handle);
            }
            Err(e) => warn!(error = %e, "presence tracking not updated"),
        }
    }

    // ---------------------------------------------------------------------
    // Backfill and catch-up
    // ---------------------------------------------------------------------

    /// Load the next page of cached messages older than those already
    /// backfilled. Returns how many rows were read.
    pub async fn load_older(&self, room: &RoomId) -> Result<usize> {
        let offset = lock(&self.rooms)
            .get(room)
            .map_or(0, |state| state.local_offset);
        let page = self
            .shared
            .cache
            .message_page(room, offset, self.shared.config.page_size)?;
        let count = page.len();

        let mut messages = Vec::with_capacity(count);
        for cached in page {
            messages.push(self.to_message(cached.record, cached.send_state).await);
        }

        lock(&self.rooms)
            .entry(room.clone())
            .or_insert_with(RoomState::new)
            .local_offset += count;
        self.publish(room, |list| {
            let mut changed = false;
            for message in messages {
                changed |= insert_new(list, message);
            }
            changed
        });
        debug!(room = %room, count, offset, "local backfill");
        Ok(count)
    }

    async fn catch_up(&self, room: &RoomId) -> Result<usize> {
        let cursor = self.shared.cache.cursor(room)?;
        let plan = FetchPlan::choose(self.is_empty(room), cursor);
        let remote = &self.shared.remote;

        let items = match &plan {
            FetchPlan::Full => remote.query_children(&path::messages(room), ChildQuery::all()).await?,
            FetchPlan::From(cursor) => {
                let mut items = remote
                    .query_children(&path::messages(room), ChildQuery::start_at(cursor.as_str()))
                    .await?;
                if items.first().is_some_and(|(key, _)| key == cursor.as_str()) {
                    items.remove(0);
                }
                items
            }
        };
        debug!(room = %room, ?plan, fetched = items.len(), "catch-up fetched");

        let mut messages = Vec::with_capacity(items.len());
        for (key, value) in items {
            if let Some(message) = self.ingest(room, &key, value).await {
                messages.push(message);
            }
        }
        let count = messages.len();
        self.publish(room, |list| {
            let mut changed = false;
            for message in messages {
                changed |= upsert(list, message);
            }
            changed
        });
        Ok(count)
    }

    /// Normalize, persist and decrypt one remote record. Malformed records
    /// are skipped.
    async fn ingest(&self, room: &RoomId, key: &str, value: Value) -> Option<Message> {
        let record = match MessageRecord::from_value(key, room, value) {
            Ok(record) => record,
            Err(e) => {
                warn!(room = %room, key, error = %e, "skipping malformed message");
                return None;
            }
        };
        if let Err(e) = self.shared.cache.store_remote_message(&record).await {
            warn!(room = %room, msg = %record.msg_id, error = %e, "message not cached");
        }
        if let Err(e) = self.shared.cache.advance_cursor(room, &MsgId::from(key)) {
            warn!(room = %room, key, error = %e, "cursor not advanced");
        }
        Some(self.to_message(record, SendState::Sent).await)
    }

    async fn to_message(&self, mut record: MessageRecord, send_state: SendState) -> Message {
        let text = if record.text.is_empty() {
            String::new()
        } else {
            self.shared
                .decrypt_or_fallback(&record.room_id, &record.text)
                .await
        };
        let attachment = match record.attachment.take() {
            Some(attachment) => Some(self.attachments.resolve(&record.msg_id, attachment).await),
            None => None,
        };
        let mut message = record.into_message(text, send_state);
        message.attachment = attachment;
        message
    }

    // ---------------------------------------------------------------------
    // Live events
    // ---------------------------------------------------------------------

    fn spawn_room_task(
        self: &Arc<Self>,
        room: RoomId,
        mut events: mpsc::UnboundedReceiver<ChildEvent>,
    ) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.apply_live_event(&room, event).await;
            }
        })
    }

    async fn apply_live_event(&self, room: &RoomId, event: ChildEvent) {
        match event.kind {
            ChildEventKind::Added => {
                if self.contains(room, &MsgId::from(event.key.as_str())) {
                    debug!(room = %room, key = %event.key, "duplicate message dropped");
                    return;
                }
                let Some(message) = self.ingest(room, &event.key, event.value).await else {
                    return;
                };
                let inserted = self.publish(room, |list| insert_new(list, message.clone()));
                if !inserted || message.sender == self.shared.me {
                    return;
                }
                self.shared.events.emit(SyncEvent::NewMessage {
                    room_id: room.clone(),
                    msg_id: message.msg_id.clone(),
                    sender: message.sender.clone(),
                });
                if self.is_open(room) {
                    let members = self.members_or_empty(room).await;
                    if let Some(record) = self
                        .receipts
                        .mark_read(room, &message.msg_id, &self.shared.me, &members)
                        .await
                    {
                        self.apply_receipts(room, record).await;
                    }
                }
            }
            ChildEventKind::Changed => {
                if let Some(message) = self.ingest(room, &event.key, event.value).await {
                    self.publish(room, |list| upsert(list, message));
                }
            }
            ChildEventKind::Removed => {
                let msg = MsgId(event.key);
                self.publish(room, |list| {
                    let before = list.len();
                    list.retain(|m| m.msg_id != msg);
                    list.len() != before
                });
                if let Err(e) = self.shared.cache.delete_message(room, &msg) {
                    warn!(room = %room, msg = %msg, error = %e, "cached message not deleted");
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Receipts
    // ---------------------------------------------------------------------

    async fn members_or_empty(&self, room: &RoomId) -> BTreeSet<UserId> {
        match self.conversations.members_of(room).await {
            Ok(members) => members,
            Err(e) => {
                warn!(room = %room, error = %e, "room members unknown");
                BTreeSet::new()
            }
        }
    }

    /// Mark every unread message from others as read and reset this user's
    /// unread counter for the room.
    async fn mark_room_read(&self, room: &RoomId) {
        let me = &self.shared.me;
        let unread: Vec<MsgId> = self
            .messages(room)
            .into_iter()
            .filter(|m| &m.sender != me && !m.receipts.has_read(me))
            .map(|m| m.msg_id)
            .collect();

        if !unread.is_empty() {
            let members = self.members_or_empty(room).await;
            for msg in &unread {
                if let Some(record) = self.receipts.mark_read(room, msg, me, &members).await {
                    self.apply_receipts(room, record).await;
                }
            }
            debug!(room = %room, count = unread.len(), "messages marked read");
        }

        match self.receipts.set_unread_count(room, 0).await {
            Ok(true) => {
                self.conversations
                    .patch_local(room, |c| c.unread_count = 0)
                    .await;
            }
            Ok(false) => {}
            Err(e) => warn!(room = %room, error = %e, "unread counter not reset"),
        }
    }

    /// Take the receipts and status of a committed record.
    async fn apply_receipts(&self, room: &RoomId, record: MessageRecord) {
        if let Err(e) = self.shared.cache.store_remote_message(&record).await {
            warn!(room = %room, msg = %record.msg_id, error = %e, "receipt not cached");
        }
        let MessageRecord {
            msg_id,
            status,
            receipts,
            ..
        } = record;
        self.patch(room, &msg_id, |message| {
            message.status = status;
            message.receipts = receipts;
        });
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Send a message. It is shown right away as pending; a failed remote
    /// write leaves it visible as failed and queues a resend, so this only
    /// errors when the message could not be composed at all.
    pub async fn send_message(&self, room: &RoomId, text: &str, attachment: Option<Attachment>) -> Result<Message> {
        self.compose(room, text, attachment, false).await
    }

    pub async fn forward_message(&self, from: &RoomId, msg: &MsgId, to: &RoomId) -> Result<Message> {
        let source = match self.message(from, msg) {
            Some(message) => message,
            None => {
                let cached = self
                    .shared
                    .cache
                    .message(from, msg)?
                    .ok_or_else(|| SyncError::NotFound(format!("message {from}/{msg}")))?;
                self.to_message(cached.record, cached.send_state).await
            }
        };
        self.compose(to, &source.text, source.attachment, true).await
    }

    async fn compose(
        &self,
        room: &RoomId,
        text: &str,
        attachment: Option<Attachment>,
        forwarded: bool,
    ) -> Result<Message> {
        if text.trim().is_empty() && attachment.is_none() {
            return Err(SyncError::Validation("message is empty".into()));
        }
        if !path::is_valid_key(room.as_str()) {
            return Err(SyncError::Validation(format!("invalid room id '{room}'")));
        }

        let ciphertext = if text.is_empty() {
            String::new()
        } else {
            self.shared.caps.encryption.encrypt(room, text).await?
        };
        let mut record = MessageRecord::new(
            MsgId::generate(),
            room.clone(),
            self.shared.me.clone(),
            ciphertext,
            now_millis(),
        );
        record.is_forwarded = forwarded;
        record.attachment = attachment.as_ref().map(|a| Attachment {
            local_url: None,
            ..a.clone()
        });

        if let Some(a) = &attachment {
            if let Some(local) = a.local_url.as_deref() {
                if let Err(e) = self.attachments.record_local_file(&record.msg_id, a, local) {
                    warn!(msg = %record.msg_id, error = %e, "local attachment not recorded");
                }
            }
        }

        let mut message = record.clone().into_message(text.to_string(), SendState::Pending);
        message.attachment = attachment;
        self.publish(room, |list| insert_new(list, message.clone()));
        if let Err(e) = self
            .shared
            .cache
            .save_message(&CachedMessage::new(record.clone(), SendState::Pending))
            .await
        {
            warn!(room = %room, msg = %record.msg_id, error = %e, "pending message not cached");
        }

        match self.deliver(room, &record).await {
            Ok(()) => debug!(room = %room, msg = %record.msg_id, "message sent"),
            Err(e) => self.fail_send(room, &record, &e).await,
        }
        Ok(self.message(room, &record.msg_id).unwrap_or(message))
    }

    /// Write `record` remotely, then update every member's chat metadata.
    async fn deliver(&self, room: &RoomId, record: &MessageRecord) -> Result<()> {
        self.shared
            .remote
            .set(&path::message(room, &record.msg_id), record.to_value()?)
            .await?;
        self.set_send_state(room, &record.msg_id, SendState::Sent).await;

        let members = self.members_or_empty(room).await;
        let kind = self.conversations.kind_of(room);
        if let Some(updated) = self
            .receipts
            .fan_out_send(room, kind, record, &members)
            .await
        {
            self.apply_receipts(room, updated).await;
        }
        Ok(())
    }

    async fn fail_send(&self, room: &RoomId, record: &MessageRecord, error: &SyncError) {
        warn!(room = %room, msg = %record.msg_id, error = %error, "send failed, queued for retry");
        self.set_send_state(room, &record.msg_id, SendState::Failed)
            .await;
        let action = ActionPayload::SendMessage {
            room_id: room.clone(),
            msg_id: record.msg_id.clone(),
        };
        if let Err(e) = self.queue.enqueue(action) {
            warn!(room = %room, msg = %record.msg_id, error = %e, "resend not queued");
        }
        self.shared.events.emit(SyncEvent::SendFailed {
            room_id: room.clone(),
            msg_id: record.msg_id.clone(),
            reason: error.to_string(),
        });
    }

    async fn set_send_state(&self, room: &RoomId, msg: &MsgId, state: SendState) {
        self.patch(room, msg, |message| message.send_state = state);
        let result = self
            .shared
            .cache
            .update_message(room, msg, |current| {
                current.map(|mut cached| {
                    cached.send_state = state;
                    cached
                })
            })
            .await;
        if let Err(e) = result {
            warn!(room = %room, msg = %msg, error = %e, "send state not cached");
        }
    }

    /// Try a failed message again right away. The queued resend stays in
    /// the queue and becomes a no-op once the message is sent.
    pub async fn retry_send(&self, room: &RoomId, msg: &MsgId) -> Result<Message> {
        let cached = self
            .shared
            .cache
            .message(room, msg)?
            .ok_or_else(|| SyncError::NotFound(format!("message {room}/{msg}")))?;
        if cached.send_state != SendState::Sent {
            self.set_send_state(room, msg, SendState::Pending).await;
            if let Err(e) = self.deliver(room, &cached.record).await {
                self.set_send_state(room, msg, SendState::Failed).await;
                return Err(e);
            }
        }
        match self.message(room, msg) {
            Some(message) => Ok(message),
            None => Ok(self.to_message(cached.record, SendState::Sent).await),
        }
    }

    /// Resend a queued message. Messages already sent, or no longer cached,
    /// need nothing.
    pub(crate) async fn redeliver(&self, room: &RoomId, msg: &MsgId) -> Result<()> {
        let Some(cached) = self.shared.cache.message(room, msg)? else {
            debug!(room = %room, msg = %msg, "queued message no longer cached");
            return Ok(());
        };
        if cached.send_state == SendState::Sent {
            return Ok(());
        }
        if let Err(e) = self.deliver(room, &cached.record).await {
            self.set_send_state(room, msg, SendState::Failed).await;
            return Err(e);
        }
        info!(room = %room, msg = %msg, "queued message delivered");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Mutations of existing messages
    // ---------------------------------------------------------------------

    fn own_message(&self, room: &RoomId, msg: &MsgId) -> Result<Message> {
        let message = self
            .message(room, msg)
            .ok_or_else(|| SyncError::NotFound(format!("message {room}/{msg}")))?;
        if message.sender != self.shared.me {
            return Err(SyncError::Validation(
                "only the sender can change this message".into(),
            ));
        }
        Ok(message)
    }

    pub async fn edit_message(&self, room: &RoomId, msg: &MsgId, text: &str) -> Result<()> {
        self.own_message(room, msg)?;
        if text.trim().is_empty() {
            return Err(SyncError::Validation("edited text is empty".into()));
        }
        let ciphertext = self.shared.caps.encryption.encrypt(room, text).await?;

        let mut patch = Map::new();
        patch.insert("text".into(), Value::String(ciphertext));
        patch.insert("isEdited".into(), Value::Bool(true));
        patch.insert("editedAt".into(), Value::from(now_millis()));
        self.mutate(room, msg, patch).await
    }

    pub async fn delete_for_me(&self, room: &RoomId, msg: &MsgId) -> Result<()> {
        let mut patch = Map::new();
        patch.insert(format!("deletedFor/users/{}", self.shared.me), Value::Bool(true));
        self.mutate(room, msg, patch).await
    }

    pub async fn delete_for_everyone(&self, room: &RoomId, msg: &MsgId) -> Result<()> {
        self.own_message(room, msg)?;
        let mut patch = Map::new();
        patch.insert("deletedFor/everyone".into(), Value::Bool(true));
        self.mutate(room, msg, patch).await
    }

    pub async fn set_pinned(&self, room: &RoomId, msg: &MsgId, pinned: bool) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("isPinned".into(), Value::Bool(pinned));
        self.mutate(room, msg, patch).await
    }

    /// Apply `patch` to the remote record, then re-read it so the list and
    /// the cache show exactly what was committed.
    async fn mutate(&self, room: &RoomId, msg: &MsgId, patch: Map<String, Value>) -> Result<()> {
        if self
            .message(room, msg)
            .is_some_and(|m| m.send_state != SendState::Sent)
        {
            return Err(SyncError::Validation(format!("message {msg} has not been sent yet")));
        }
        let target = path::message(room, msg);
        self.shared.remote.update(&target, patch).await?;
        let value = self
            .shared
            .remote
            .get(&target)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("message {room}/{msg}")))?;
        if let Some(message) = self.ingest(room, msg.as_str(), value).await {
            self.publish(room, |list| upsert(list, message));
        }
        Ok(())
    }

    /// Mark every message of `room` deleted for this user, remotely and
    /// locally. Used when the whole chat is deleted.
    pub async fn delete_all_for_me(&self, room: &RoomId) -> Result<()> {
        let me = self.shared.me.clone();
        let keys: Vec<String> = self
            .shared
            .remote
            .query_children(&path::messages(room), ChildQuery::all())
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        if !keys.is_empty() {
            let patch: Map<String, Value> = keys
                .iter()
                .map(|key| (format!("{key}/deletedFor/users/{me}"), Value::Bool(true)))
                .collect();
            self.shared
                .remote
                .update(&path::messages(room), patch)
                .await?;
        }

        self.close_room(room).await?;
        for cached in self.shared.cache.all_messages(room)? {
            let msg = cached.record.msg_id;
            let result = self
                .shared
                .cache
                .update_message(room, &msg, |current| {
                    current.map(|mut cached| {
                        cached.record.deleted_for.users.insert(me.clone());
                        cached
                    })
                })
                .await;
            if let Err(e) = result {
                warn!(room = %room, msg = %msg, error = %e, "cached message not marked deleted");
            }
        }
        self.publish(room, |list| {
            for message in list.iter_mut() {
                message.deleted_for.users.insert(me.clone());
            }
            !list.is_empty()
        });
        info!(room = %room, count = keys.len(), "chat deleted for this user");
        Ok(())
    }
}

/// Insert unless a message with the same id is already listed.
fn insert_new(list: &mut Vec<Message>, message: Message) -> bool {
    if list.iter().any(|m| m.msg_id == message.msg_id) {
        return false;
    }
    list.push(message);
    true
}

/// Replace the listed copy of a message, or add it.
fn upsert(list: &mut Vec<Message>, message: Message) -> bool {
    match list.iter_mut().find(|m| m.msg_id == message.msg_id) {
        Some(existing) if *existing == message => false,
        Some(existing) => {
            *existing = message;
            true
        }
        None => {
            list.push(message);
            true
        }
    }
}
