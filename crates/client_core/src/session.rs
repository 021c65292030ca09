//! One user's live view of one chat: a realtime window feeding the
//! timeline, plus the send pipeline with its moderation gate, attachment
//! uploads, optimistic insertion, and settlement.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use shared::assist::Assistant;
use shared::domain::{
    ChatId, Message, MessageId, MessageKind, MessageRef, ModerationStatus, ModerationVerdict,
    PendingId, UserId,
};
use storage::{NewMessage, Store, SubscriptionUpdate};

use crate::timeline::{MessagePatch, Timeline};
use crate::upload::{AttachmentUploader, LocalAttachment};
use crate::{ClientError, ClientResult};

/// A send request as the UI hands it over: raw text and local files.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub text: Option<String>,
    pub attachments: Vec<LocalAttachment>,
    pub kind: MessageKind,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
            kind: MessageKind::Text,
        }
    }
}

pub struct ChatSession {
    store: Store,
    chat_id: ChatId,
    user_id: UserId,
    assistant: Arc<dyn Assistant>,
    uploader: Arc<dyn AttachmentUploader>,
    timeline: Arc<Mutex<Timeline>>,
    notice: Arc<Mutex<Option<String>>>,
    reader: JoinHandle<()>,
}

impl ChatSession {
    /// Opens the session and starts folding realtime window emissions into
    /// the timeline. A window query failure upstream keeps the last folded
    /// state and is reported through [`ChatSession::take_notice`].
    pub fn open(
        store: Store,
        chat_id: ChatId,
        user_id: UserId,
        assistant: Arc<dyn Assistant>,
        uploader: Arc<dyn AttachmentUploader>,
        page_size: u32,
    ) -> Self {
        let timeline = Arc::new(Mutex::new(Timeline::new()));
        let notice = Arc::new(Mutex::new(None));
        let mut subscription = store.subscribe_latest(chat_id.clone(), page_size);
        let folded = Arc::clone(&timeline);
        let noticed = Arc::clone(&notice);
        let session_chat = chat_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(update) = subscription.recv().await {
                match update {
                    SubscriptionUpdate::Snapshot(snapshot) => {
                        folded.lock().await.merge_window(snapshot);
                    }
                    SubscriptionUpdate::Error(message) => {
                        warn!(chat_id = %session_chat, %message, "message window refresh failed");
                        *noticed.lock().await = Some(message);
                    }
                }
            }
        });

        Self {
            store,
            chat_id,
            user_id,
            assistant,
            uploader,
            timeline,
            notice,
            reader,
        }
    }

    /// Current visible sequence, ascending by creation instant.
    pub async fn messages(&self) -> Vec<Message> {
        self.timeline.lock().await.messages()
    }

    /// Latest subscription failure notice, cleared on read. The timeline
    /// keeps showing the last good state while one is pending.
    pub async fn take_notice(&self) -> Option<String> {
        self.notice.lock().await.take()
    }

    /// Full send pipeline. The optimistic entry appears before any
    /// asynchronous step runs and is rolled back on every failure path.
    pub async fn send(&self, outgoing: OutgoingMessage) -> ClientResult<Message> {
        let text = outgoing.text.as_deref().and_then(|t| {
            let trimmed = t.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });
        if text.is_none() && outgoing.attachments.is_empty() {
            return Err(ClientError::Validation(
                "message needs text or at least one attachment".into(),
            ));
        }

        let pending_id = PendingId::generate();
        let optimistic = Message {
            chat_id: self.chat_id.clone(),
            id: MessageRef::Pending(pending_id.clone()),
            sender_id: self.user_id.clone(),
            text: text.clone(),
            attachments: Vec::new(),
            kind: outgoing.kind,
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            reactions: BTreeMap::new(),
            read_by: Default::default(),
            moderation: Some(ModerationVerdict {
                status: ModerationStatus::Pending,
                reason: None,
            }),
        };
        self.timeline.lock().await.prepend_optimistic(optimistic);

        match self.run_send(&pending_id, text, outgoing).await {
            Ok(message) => {
                self.timeline
                    .lock()
                    .await
                    .settle(&pending_id, Some(message.clone()), true);
                Ok(message)
            }
            Err(error) => {
                self.timeline.lock().await.settle(&pending_id, None, false);
                Err(error)
            }
        }
    }

    async fn run_send(
        &self,
        pending_id: &PendingId,
        text: Option<String>,
        outgoing: OutgoingMessage,
    ) -> ClientResult<Message> {
        let moderation = match &text {
            Some(text) => {
                let outcome = self.assistant.moderate(text).await?;
                if !outcome.approved {
                    return Err(ClientError::ModerationRejected {
                        reason: outcome
                            .reason
                            .unwrap_or_else(|| "rejected by moderation".into()),
                    });
                }
                Some(ModerationVerdict {
                    status: ModerationStatus::Approved,
                    reason: None,
                })
            }
            None => None,
        };

        let mut attachments = Vec::with_capacity(outgoing.attachments.len());
        for local in &outgoing.attachments {
            attachments.push(self.uploader.upload(&self.chat_id, local).await?);
        }
        if !attachments.is_empty() {
            self.timeline.lock().await.update_patch(
                pending_id,
                MessagePatch {
                    attachments: Some(attachments.clone()),
                    ..MessagePatch::default()
                },
            );
        }

        let participants = self
            .store
            .get_chat(&self.chat_id)
            .await?
            .map(|chat| chat.participants)
            .unwrap_or_default();

        let message = self
            .store
            .create_message(NewMessage {
                chat_id: self.chat_id.clone(),
                sender_id: self.user_id.clone(),
                text,
                attachments,
                kind: outgoing.kind,
                participants,
                moderation,
            })
            .await?;
        Ok(message)
    }

    pub async fn edit(&self, message_id: &MessageId, new_text: &str) -> ClientResult<Message> {
        Ok(self
            .store
            .edit_message(&self.chat_id, message_id, new_text)
            .await?)
    }

    pub async fn soft_delete(&self, message_id: &MessageId) -> ClientResult<()> {
        Ok(self
            .store
            .soft_delete_message(&self.chat_id, message_id)
            .await?)
    }

    pub async fn toggle_reaction(&self, message_id: &MessageId, emoji: &str) -> ClientResult<Message> {
        Ok(self
            .store
            .toggle_reaction(&self.chat_id, message_id, emoji, &self.user_id)
            .await?)
    }

    /// Unions this user into `read_by` for every visible confirmed message
    /// from another sender. Idempotent.
    pub async fn mark_visible_read(&self) -> ClientResult<()> {
        let unread = self.timeline.lock().await.unread_by(&self.user_id);
        if unread.is_empty() {
            return Ok(());
        }
        Ok(self
            .store
            .mark_read(&self.chat_id, &unread, &self.user_id)
            .await?)
    }

    /// Loads one backward page behind the oldest loaded message and folds
    /// it in. Returns whether further history remains.
    pub async fn load_older(&self, page_size: u32) -> ClientResult<bool> {
        let cursor = {
            let timeline = self.timeline.lock().await;
            if !timeline.has_more() {
                return Ok(false);
            }
            match timeline.oldest_confirmed().map(|message| message.id.clone()) {
                Some(MessageRef::Confirmed(id)) => id,
                _ => return Ok(false),
            }
        };

        let page = self.store.load_older(&self.chat_id, &cursor, page_size).await?;
        let mut timeline = self.timeline.lock().await;
        timeline.merge_older_page(page);
        Ok(timeline.has_more())
    }

    /// Stops the realtime fold immediately.
    pub fn close(self) {
        // Drop aborts the reader task.
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
