use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use parley_remote::{MemoryBackend, MemoryRemote};
use parley_shared::crypto::RoomKeyCipher;
use parley_shared::{Profile, UserId};
use parley_store::Database;
use parley_sync::{Capabilities, Media, Profiles, SyncConfig, SyncContext, UploadTarget};

pub const MASTER: [u8; 32] = [42u8; 32];

pub struct StaticMedia;

#[async_trait]
impl Media for StaticMedia {
    async fn download_url(&self, media_id: &str) -> anyhow::Result<String> {
        Ok(format!("https://cdn.example/{media_id}"))
    }

    async fn upload_target(&self, media_type: &str, size: u64) -> anyhow::Result<UploadTarget> {
        Ok(UploadTarget {
            url: format!("https://upload.example/{media_type}"),
            media_id: format!("m{size}"),
        })
    }
}

pub struct NoProfiles;

#[async_trait]
impl Profiles for NoProfiles {
    async fn profile(&self, _user: &UserId) -> anyhow::Result<Option<Profile>> {
        Ok(None)
    }
}

pub fn capabilities() -> Capabilities {
    Capabilities {
        encryption: Arc::new(RoomKeyCipher::new(MASTER)),
        media: Arc::new(StaticMedia),
        profiles: Arc::new(NoProfiles),
    }
}

/// A context for `me` on its own connection to `backend`.
pub async fn context(backend: &MemoryBackend, me: &str) -> (SyncContext, Arc<MemoryRemote>) {
    parley_sync::logging::init_tracing();
    let remote = Arc::new(backend.connect());
    let ctx = SyncContext::init(
        UserId::from(me),
        remote.clone(),
        Database::open_in_memory().unwrap(),
        capabilities(),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    (ctx, remote)
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}
