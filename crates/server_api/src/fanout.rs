//! Notification fan-out: one multicast push per created message, best
//! effort end to end. Nothing here ever fails the write that triggered it.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shared::domain::{Chat, Message, MessageKind, UserId};
use storage::{ChangeEvent, Store};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PushData {
    pub chat_id: String,
    pub message_id: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PushPayload {
    pub tokens: Vec<String>,
    pub notification: PushNotification,
    pub data: PushData,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    /// Delivers one multicast push. Per-token failures are the sender's to
    /// log; only transport-level failure is reported.
    async fn send(&self, payload: &PushPayload) -> Result<(), String>;
}

/// Default sender when no push credential is configured: logs the would-be
/// delivery and succeeds.
pub struct LoggingPushSender;

#[async_trait]
impl PushSender for LoggingPushSender {
    async fn send(&self, payload: &PushPayload) -> Result<(), String> {
        debug!(
            tokens = payload.tokens.len(),
            chat_id = %payload.data.chat_id,
            "push delivery skipped, no sender configured"
        );
        Ok(())
    }
}

/// Multicast over a JSON HTTP endpoint.
pub struct HttpPushSender {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl HttpPushSender {
    pub fn new(endpoint: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            server_key: server_key.into(),
        }
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send(&self, payload: &PushPayload) -> Result<(), String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.server_key)
            .json(payload)
            .send()
            .await
            .map_err(|error| error.to_string())?;
        if !response.status().is_success() {
            return Err(format!("push endpoint returned {}", response.status()));
        }
        Ok(())
    }
}

/// Recipients for one message: participants minus the sender minus everyone
/// who muted the chat.
pub fn resolve_fanout_targets(
    participants: &BTreeSet<UserId>,
    sender: &UserId,
    muted_by: &BTreeSet<UserId>,
) -> BTreeSet<UserId> {
    participants
        .iter()
        .filter(|id| *id != sender && !muted_by.contains(*id))
        .cloned()
        .collect()
}

/// Consumes the store's change feed and pushes once per created message.
/// Lagging behind the feed skips notifications rather than stalling writes.
pub fn spawn_fanout_worker(store: Store, sender: Arc<dyn PushSender>) -> JoinHandle<()> {
    let mut changes = store.subscribe_changes();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(ChangeEvent::MessageCreated {
                    message,
                    participants,
                }) => {
                    if let Err(error) =
                        notify_message(&store, sender.as_ref(), &message, &participants).await
                    {
                        warn!(chat_id = %message.chat_id, %error, "notification fan-out failed");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change feed lagged; notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn notify_message(
    store: &Store,
    sender: &dyn PushSender,
    message: &Message,
    participants: &BTreeSet<UserId>,
) -> Result<(), String> {
    let chat = store
        .get_chat(&message.chat_id)
        .await
        .map_err(|error| error.to_string())?;
    let muted_by = chat
        .as_ref()
        .map(|chat| chat.muted_by.clone())
        .unwrap_or_default();

    let targets = resolve_fanout_targets(participants, &message.sender_id, &muted_by);
    if targets.is_empty() {
        return Ok(());
    }

    let target_ids: Vec<UserId> = targets.into_iter().collect();
    let tokens = store
        .push_tokens_for(&target_ids)
        .await
        .map_err(|error| error.to_string())?;
    if tokens.is_empty() {
        return Ok(());
    }

    let payload = PushPayload {
        tokens,
        notification: PushNotification {
            title: notification_title(store, chat.as_ref(), message).await,
            body: notification_body(message),
        },
        data: PushData {
            chat_id: message.chat_id.to_string(),
            message_id: String::from(message.id.clone()),
            kind: kind_label(message.kind).to_string(),
        },
    };
    sender.send(&payload).await
}

async fn notification_title(store: &Store, chat: Option<&Chat>, message: &Message) -> String {
    if let Some(name) = chat.and_then(|chat| chat.name.clone()) {
        return name;
    }
    match store.get_users(std::slice::from_ref(&message.sender_id)).await {
        Ok(users) => users
            .into_iter()
            .next()
            .map(|user| user.display_name.unwrap_or(user.email))
            .unwrap_or_else(|| "New message".to_string()),
        Err(error) => {
            warn!(%error, "sender lookup for notification title failed");
            "New message".to_string()
        }
    }
}

fn notification_body(message: &Message) -> String {
    message
        .text
        .clone()
        .or_else(|| {
            message
                .attachments
                .first()
                .map(|attachment| attachment.display_name.clone())
        })
        .unwrap_or_else(|| "Sent an attachment".to_string())
}

fn kind_label(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::Video => "video",
        MessageKind::File => "file",
        MessageKind::System => "system",
    }
}
