//! Attachment upload capability boundary. The send flow hands local bytes
//! to an uploader and persists only the returned metadata.

use async_trait::async_trait;

use shared::domain::{Attachment, ChatId};

use crate::{ClientError, ClientResult};

/// A file selected locally, not yet uploaded anywhere.
#[derive(Debug, Clone)]
pub struct LocalAttachment {
    pub data: Vec<u8>,
    pub content_type: String,
    pub display_name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, chat_id: &ChatId, local: &LocalAttachment) -> ClientResult<Attachment>;
}

/// Placeholder for sessions opened without upload support. Text-only sends
/// never hit it.
pub struct MissingAttachmentUploader;

#[async_trait]
impl AttachmentUploader for MissingAttachmentUploader {
    async fn upload(&self, chat_id: &ChatId, local: &LocalAttachment) -> ClientResult<Attachment> {
        Err(ClientError::Upload(format!(
            "no uploader configured for '{}' in chat {chat_id}",
            local.display_name
        )))
    }
}
