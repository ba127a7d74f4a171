//! Attachment URL resolution: local file, then cached remote URL, then a
//! fresh presigned URL from the media service while online.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use parley_shared::{Attachment, MsgId};
use parley_store::CachedAttachment;

use crate::capabilities::UploadTarget;
use crate::context::Shared;
use crate::error::Result;

pub struct AttachmentResolver {
    shared: Arc<Shared>,
}

impl AttachmentResolver {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Fill in the best displayable URL for `attachment`. Never fails: an
    /// attachment that cannot be resolved is returned as received.
    pub async fn resolve(&self, msg: &MsgId, mut attachment: Attachment) -> Attachment {
        let cached = match self.shared.cache.with_db(|db| db.get_attachment(msg)) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(msg = %msg, error = %e, "attachment cache unreadable");
                None
            }
        };

        if let Some(cached) = cached {
            if cached.local_url.is_some() {
                attachment.local_url = cached.local_url;
                attachment.cdn_url = cached.cdn_url.or(attachment.cdn_url);
                return attachment;
            }
            if cached.cdn_url.is_some() {
                attachment.cdn_url = cached.cdn_url;
                return attachment;
            }
        }
        if attachment.cdn_url.is_some() {
            return attachment;
        }

        if !self.shared.remote.is_connected() {
            debug!(msg = %msg, media = %attachment.media_id, "offline, attachment left unresolved");
            return attachment;
        }
        match self
            .shared
            .caps
            .media
            .download_url(&attachment.media_id)
            .await
        {
            Ok(url) => {
                let stored = self.shared.cache.with_db(|db| {
                    db.set_attachment_cdn_url(
                        msg,
                        &attachment.media_id,
                        &attachment.media_type,
                        &url,
                        Utc::now(),
                    )
                });
                if let Err(e) = stored {
                    warn!(msg = %msg, error = %e, "attachment url not cached");
                }
                attachment.cdn_url = Some(url);
            }
            Err(e) => {
                warn!(msg = %msg, media = %attachment.media_id, error = %e, "attachment left unresolved");
            }
        }
        attachment
    }

    /// Remember that the file behind `attachment` now exists locally.
    pub fn record_local_file(&self, msg: &MsgId, attachment: &Attachment, local_url: &str) -> Result<()> {
        self.shared.cache.with_db(|db| {
            db.set_attachment_local_url(msg, &attachment.media_id, &attachment.media_type, local_url)
        })
    }

    pub fn cached(&self, msg: &MsgId) -> Result<Option<CachedAttachment>> {
        self.shared.cache.with_db(|db| db.get_attachment(msg))
    }

    /// Ask the media service where to upload a new file.
    pub async fn prepare_upload(&self, media_type: &str, size: u64) -> Result<UploadTarget> {
        Ok(self.shared.caps.media.upload_target(media_type, size).await?)
    }
}
