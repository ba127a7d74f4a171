//! Engine context: one per signed-in user.
//!
//! [`SyncContext::init`] wires the engines around a remote connection and
//! a local cache and starts the connectivity supervisor. Every subscription
//! the context owns ends with [`SyncContext::shutdown`] or when it is
//! dropped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_remote::RemoteStore;
use parley_shared::constants::UNDECRYPTABLE_PLACEHOLDER;
use parley_shared::crypto::looks_sealed;
use parley_shared::{ActionPayload, Attachment, Conversation, Message, MsgId, RoomId, UserId};
use parley_store::Database;

use crate::actions::{apply_social, SocialActions};
use crate::attachments::AttachmentResolver;
use crate::cache::{LocalCache, RetryPolicy};
use crate::capabilities::Capabilities;
use crate::config::SyncConfig;
use crate::conversations::ConversationEngine;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::messages::MessageEngine;
use crate::offline_queue::{ActionApplier, DrainReport, OfflineQueue};
use crate::presence::PresenceTracker;
use crate::receipts::ReceiptEngine;

/// State every engine reads.
pub(crate) struct Shared {
    pub(crate) me: UserId,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) cache: LocalCache,
    pub(crate) caps: Capabilities,
    pub(crate) config: SyncConfig,
    pub(crate) events: EventBus,
}

impl Shared {
    /// Decrypt message text for display. Undecryptable legacy plaintext is
    /// shown as stored; real ciphertext that fails becomes a placeholder.
    pub(crate) async fn decrypt_or_fallback(&self, room: &RoomId, ciphertext: &str) -> String {
        match self.caps.encryption.decrypt(room, ciphertext).await {
            Ok(plaintext) => plaintext,
            Err(e) if looks_sealed(ciphertext) => {
                warn!(room = %room, error = %e, "message could not be decrypted");
                UNDECRYPTABLE_PLACEHOLDER.to_string()
            }
            Err(_) => {
                debug!(room = %room, "showing unencrypted legacy text");
                ciphertext.to_string()
            }
        }
    }
}

/// Replays queued actions: message sends go back through the message
/// engine, everything else is a social write.
struct EngineApplier {
    shared: Arc<Shared>,
    messages: Arc<MessageEngine>,
}

#[async_trait]
impl ActionApplier for EngineApplier {
    async fn apply(&self, action: &ActionPayload) -> Result<()> {
        match action {
            ActionPayload::SendMessage { room_id, msg_id } => {
                self.messages.redeliver(room_id, msg_id).await
            }
            other => apply_social(&self.shared, other).await,
        }
    }
}

struct Engines {
    shared: Arc<Shared>,
    conversations: Arc<ConversationEngine>,
    messages: Arc<MessageEngine>,
    receipts: Arc<ReceiptEngine>,
    presence: Arc<PresenceTracker>,
    queue: Arc<OfflineQueue>,
    actions: SocialActions,
    attachments: Arc<AttachmentResolver>,
    applier: EngineApplier,
}

impl Engines {
    async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        let list = self.conversations.load().await?;
        let marked = self.receipts.delivery_sweep(&list).await;
        if marked > 0 {
            debug!(marked, "delivery receipts healed");
        }
        Ok(list)
    }

    async fn drain_queue(&self) -> Result<DrainReport> {
        self.queue.drain(&self.applier).await
    }

    /// Work done on every offline to online transition.
    async fn on_reconnect(&self) {
        if let Err(e) = self.presence.set_own_presence(true).await {
            warn!(error = %e, "presence not published after reconnect");
        }
        if let Err(e) = self.receipts.rearm_active_room().await {
            warn!(error = %e, "active room not restored after reconnect");
        }
        if let Err(e) = self.drain_queue().await {
            warn!(error = %e, "queue not drained after reconnect");
        }
        self.messages.catch_up_open_rooms().await;
        if self.conversations.is_listening() {
            if let Err(e) = self.load_conversations().await {
                warn!(error = %e, "conversations not reloaded after reconnect");
            }
        }
    }
}

pub struct SyncContext {
    engines: Arc<Engines>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncContext {
    /// Build the engines for `me`. When the remote store is reachable, own
    /// presence is published and any actions left from a previous session
    /// are replayed before this returns.
    pub async fn init(
        me: UserId,
        remote: Arc<dyn RemoteStore>,
        db: Database,
        caps: Capabilities,
        config: SyncConfig,
    ) -> Result<Self> {
        let cache = LocalCache::new(
            db,
            RetryPolicy {
                attempts: config.cache_retry_attempts,
                base: config.cache_retry_base,
            },
        );
        let shared = Arc::new(Shared {
            me,
            remote,
            cache,
            caps,
            events: EventBus::new(config.event_capacity),
            config,
        });

        let conversations = Arc::new(ConversationEngine::new(shared.clone()));
        let receipts = Arc::new(ReceiptEngine::new(shared.clone()));
        let presence = Arc::new(PresenceTracker::new(shared.clone()));
        let attachments = Arc::new(AttachmentResolver::new(shared.clone()));
        let queue = Arc::new(OfflineQueue::new(shared.clone()));
        let messages = Arc::new(MessageEngine::new(
            shared.clone(),
            conversations.clone(),
            receipts.clone(),
            presence.clone(),
            attachments.clone(),
            queue.clone(),
        ));
        let engines = Arc::new(Engines {
            actions: SocialActions::new(shared.clone(), queue.clone()),
            applier: EngineApplier {
                shared: shared.clone(),
                messages: messages.clone(),
            },
            shared,
            conversations,
            messages,
            receipts,
            presence,
            queue,
            attachments,
        });

        if engines.shared.remote.is_connected() {
            if let Err(e) = engines.presence.set_own_presence(true).await {
                warn!(error = %e, "initial presence not published");
            }
            if let Err(e) = engines.drain_queue().await {
                warn!(error = %e, "initial queue drain failed");
            }
        }

        let supervisor = spawn_supervisor(&engines);
        info!(user = %engines.shared.me, "sync context initialised");
        Ok(Self {
            engines,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Open the local cache at the configured path, or in the platform data
    /// directory.
    pub fn open_database(config: &SyncConfig) -> Result<Database> {
        let db = match &config.db_path {
            Some(path) => Database::open_at(path)?,
            None => Database::open_default()?,
        };
        Ok(db)
    }

    pub fn me(&self) -> &UserId {
        &self.engines.shared.me
    }

    pub fn config(&self) -> &SyncConfig {
        &self.engines.shared.config
    }

    pub fn conversations(&self) -> &Arc<ConversationEngine> {
        &self.engines.conversations
    }

    pub fn messages(&self) -> &Arc<MessageEngine> {
        &self.engines.messages
    }

    pub fn receipts(&self) -> &Arc<ReceiptEngine> {
        &self.engines.receipts
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.engines.presence
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.engines.queue
    }

    pub fn actions(&self) -> &SocialActions {
        &self.engines.actions
    }

    pub fn attachments(&self) -> &Arc<AttachmentResolver> {
        &self.engines.attachments
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.engines.shared.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Orchestration
    // ---------------------------------------------------------------------

    /// Load the conversation list and heal delivery receipts of rooms with
    /// unread messages.
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.engines.load_conversations().await
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.engines.conversations.subscribe()
    }

    pub async fn open_room(&self, room: &RoomId) -> Result<watch::Receiver<Vec<Message>>> {
        self.engines.messages.open_room(room).await
    }

    pub async fn close_room(&self, room: &RoomId) -> Result<()> {
        self.engines.messages.close_room(room).await
    }

    pub async fn send_message(&self, room: &RoomId, text: &str) -> Result<Message> {
        self.engines.messages.send_message(room, text, None).await
    }

    pub async fn send_attachment(&self, room: &RoomId, caption: &str, attachment: Attachment) -> Result<Message> {
        self.engines
            .messages
            .send_message(room, caption, Some(attachment))
            .await
    }

    pub async fn retry_send(&self, room: &RoomId, msg: &MsgId) -> Result<Message> {
        self.engines.messages.retry_send(room, msg).await
    }

    pub async fn set_typing(&self, room: &RoomId, is_typing: bool) -> Result<()> {
        self.engines.presence.set_typing(room, is_typing).await
    }

    /// Set this user's unread counter for `room`, mirroring it locally.
    pub async fn set_unread_count(&self, room: &RoomId, count: u32) -> Result<bool> {
        let written = self.engines.receipts.set_unread_count(room, count).await?;
        if written {
            self.engines
                .conversations
                .patch_local(room, |c| c.unread_count = count)
                .await;
        }
        Ok(written)
    }

    pub async fn mark_unread(&self, room: &RoomId) -> Result<bool> {
        self.set_unread_count(room, 1).await
    }

    /// Delete a chat for this user: every message is marked deleted for
    /// them and the room leaves their index.
    pub async fn delete_chat(&self, room: &RoomId) -> Result<()> {
        self.engines.messages.delete_all_for_me(room).await?;
        self.engines.conversations.remove_room(room).await?;
        info!(room = %room, "chat deleted");
        Ok(())
    }

    pub async fn drain_queue(&self) -> Result<DrainReport> {
        self.engines.drain_queue().await
    }

    /// Close every room, publish offline presence if possible and release
    /// every subscription. The context stays usable for reads.
    pub async fn shutdown(&self) {
        if let Some(supervisor) = self.take_supervisor() {
            supervisor.abort();
        }
        self.engines.messages.close_all().await;
        self.engines.conversations.detach();
        if self.engines.shared.remote.is_connected() {
            if let Err(e) = self.engines.presence.set_own_presence(false).await {
                warn!(error = %e, "offline presence not published");
            }
        }
        self.engines.presence.stop_all();
        info!(user = %self.engines.shared.me, "sync context shut down");
    }

    fn take_supervisor(&self) -> Option<JoinHandle<()>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(supervisor) = self.take_supervisor() {
            supervisor.abort();
        }
        self.engines.conversations.detach();
        self.engines.presence.stop_all();
    }
}

/// Follow the connectivity signal and catch up on every reconnect.
fn spawn_supervisor(engines: &Arc<Engines>) -> JoinHandle<()> {
    let mut connectivity = engines.shared.remote.connectivity();
    let engines = Arc::downgrade(engines);
    tokio::spawn(async move {
        let mut online = *connectivity.borrow_and_update();
        while connectivity.changed().await.is_ok() {
            let now = *connectivity.borrow_and_update();
            if now == online {
                continue;
            }
            online = now;
            let Some(engines) = engines.upgrade() else {
                break;
            };
            info!(online, "connectivity changed");
            engines
                .shared
                .events
                .emit(SyncEvent::ConnectivityChanged { online });
            if online {
                engines.on_reconnect().await;
            }
        }
    })
}
