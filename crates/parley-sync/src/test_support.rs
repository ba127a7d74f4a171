use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use parley_remote::{MemoryBackend, MemoryRemote};
use parley_shared::crypto::RoomKeyCipher;
use parley_shared::{Profile, UserId};
use parley_store::Database;

use crate::cache::{LocalCache, RetryPolicy};
use crate::capabilities::{Capabilities, Media, Profiles, UploadTarget};
use crate::config::SyncConfig;
use crate::context::Shared;
use crate::events::EventBus;

pub(crate) const MASTER: [u8; 32] = [7u8; 32];

#[derive(Default)]
pub(crate) struct StubMedia {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Media for StubMedia {
    async fn download_url(&self, media_id: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("media service down");
        }
        Ok(format!("https://cdn.test/{media_id}"))
    }

    async fn upload_target(&self, media_type: &str, size: u64) -> anyhow::Result<UploadTarget> {
        Ok(UploadTarget {
            url: format!("https://upload.test/{media_type}/{size}"),
            media_id: format!("media-{size}"),
        })
    }
}

#[derive(Default)]
pub(crate) struct StubProfiles {
    pub profiles: Mutex<HashMap<UserId, Profile>>,
    pub fail: AtomicBool,
}

impl StubProfiles {
    pub fn insert(&self, user: &str, profile: Profile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(UserId::from(user), profile);
    }
}

#[async_trait]
impl Profiles for StubProfiles {
    async fn profile(&self, user: &UserId) -> anyhow::Result<Option<Profile>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("profile service down");
        }
        Ok(self.profiles.lock().unwrap().get(user).cloned())
    }
}

pub(crate) struct Harness {
    pub shared: Arc<Shared>,
    pub remote: Arc<MemoryRemote>,
    pub media: Arc<StubMedia>,
    pub profiles: Arc<StubProfiles>,
}

pub(crate) fn harness(backend: &MemoryBackend, me: &str) -> Harness {
    let remote = Arc::new(backend.connect());
    let media = Arc::new(StubMedia::default());
    let profiles = Arc::new(StubProfiles::default());
    let config = SyncConfig::default();
    let cache = LocalCache::new(
        Database::open_in_memory().unwrap(),
        RetryPolicy {
            attempts: config.cache_retry_attempts,
            base: config.cache_retry_base,
        },
    );
    let shared = Arc::new(Shared {
        me: UserId::from(me),
        remote: remote.clone(),
        cache,
        caps: Capabilities {
            encryption: Arc::new(RoomKeyCipher::new(MASTER)),
            media: media.clone(),
            profiles: profiles.clone(),
        },
        events: EventBus::new(config.event_capacity),
        config,
    });
    Harness {
        shared,
        remote,
        media,
        profiles,
    }
}
