//! Client-side chat pipeline: the optimistic timeline merge engine, the send
//! flow with its moderation and upload gates, roster aggregation, and the
//! presence/typing channel. Everything here sits on top of the realtime
//! store and stays usable while individual subscriptions fail.

use thiserror::Error;

use shared::error::ApiException;
use storage::StoreError;

pub mod presence;
pub mod roster;
pub mod session;
pub mod timeline;
pub mod upload;

pub use presence::{PresenceStatus, PresenceTracker, TypingPublisher};
pub use roster::{ChatRoster, ChatSummary};
pub use session::{ChatSession, OutgoingMessage};
pub use timeline::{MessagePatch, Timeline};
pub use upload::{AttachmentUploader, LocalAttachment, MissingAttachmentUploader};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("message rejected by moderation: {reason}")]
    ModerationRejected { reason: String },
    #[error("attachment upload failed: {0}")]
    Upload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Assistant(#[from] ApiException),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
