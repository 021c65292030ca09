//! Message collection client: realtime window subscription, backward
//! pagination, and the commuting per-user mutations.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use shared::domain::{
    Attachment, ChatId, Message, MessageId, MessageKind, MessageRef, ModerationVerdict, UserId,
};

use crate::{
    decode_instant, decode_instant_opt, encode_instant, ChangeEvent, Store, StoreError,
    StoreResult, Subscription, SubscriptionUpdate,
};

pub const DEFAULT_PAGE_SIZE: u32 = 40;

/// Full current window of a chat's newest messages, descending by creation
/// instant. Every subscription emission carries the whole window, not a
/// delta; the consumer diffs.
#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    pub kind: MessageKind,
    /// Side-channel hint for notification fan-out; not persisted with the
    /// message.
    pub participants: BTreeSet<UserId>,
    pub moderation: Option<ModerationVerdict>,
}

impl Store {
    /// Persists a message with a server-assigned creation instant, updates
    /// the chat's denormalized last-message fields, and feeds the change
    /// stream.
    pub async fn create_message(&self, new: NewMessage) -> StoreResult<Message> {
        let text = new.text.and_then(|t| {
            let trimmed = t.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });
        if text.is_none() && new.attachments.is_empty() {
            return Err(StoreError::Validation(
                "message needs text or at least one attachment".into(),
            ));
        }

        let id = MessageId::new(Uuid::new_v4().to_string());
        let created_at = Utc::now();
        let message = Message {
            chat_id: new.chat_id.clone(),
            id: MessageRef::Confirmed(id.clone()),
            sender_id: new.sender_id.clone(),
            text,
            attachments: new.attachments,
            kind: new.kind,
            created_at,
            edited_at: None,
            deleted_at: None,
            reactions: BTreeMap::new(),
            read_by: BTreeSet::new(),
            moderation: new.moderation,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, body, kind, attachments, reactions, read_by, moderation, created_at)
             VALUES (?, ?, ?, ?, ?, ?, '{}', '[]', ?, ?)",
        )
        .bind(id.as_str())
        .bind(new.chat_id.as_str())
        .bind(new.sender_id.as_str())
        .bind(message.text.as_deref())
        .bind(encode_kind(message.kind))
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(
            message
                .moderation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(encode_instant(created_at))
        .execute(&mut *tx)
        .await?;

        let preview = message
            .text
            .clone()
            .or_else(|| {
                message
                    .attachments
                    .first()
                    .map(|a| a.display_name.clone())
            })
            .unwrap_or_else(|| "Attachment".to_string());
        sqlx::query(
            "UPDATE chats SET last_message = ?, last_message_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&preview)
        .bind(encode_instant(created_at))
        .bind(encode_instant(created_at))
        .bind(new.chat_id.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.emit(ChangeEvent::MessageCreated {
            message: message.clone(),
            participants: new.participants,
        });
        self.emit(ChangeEvent::ChatsChanged {
            chat_id: new.chat_id,
        });
        Ok(message)
    }

    /// Replaces the text of a live message and stamps `edited_at`.
    /// Attachments and reactions are untouched.
    pub async fn edit_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        new_text: &str,
    ) -> StoreResult<Message> {
        let trimmed = new_text.trim();
        if trimmed.is_empty() {
            return Err(StoreError::Validation("edit text must not be empty".into()));
        }

        let updated = sqlx::query(
            "UPDATE messages SET body = ?, edited_at = ?
             WHERE chat_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(trimmed)
        .bind(encode_instant(Utc::now()))
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "message {message_id} in chat {chat_id}"
            )));
        }

        self.emit(ChangeEvent::MessagesChanged {
            chat_id: chat_id.clone(),
        });
        self.fetch_message(chat_id, message_id).await
    }

    /// Marks a message deleted. Stored text and attachments are retained for
    /// audit but every read path hides them from then on.
    pub async fn soft_delete_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> StoreResult<()> {
        let updated = sqlx::query(
            "UPDATE messages SET deleted_at = ?
             WHERE chat_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(encode_instant(Utc::now()))
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            // Missing or already deleted; deletion is idempotent either way.
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM messages WHERE chat_id = ? AND id = ?")
                    .bind(chat_id.as_str())
                    .bind(message_id.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!(
                    "message {message_id} in chat {chat_id}"
                )));
            }
        }

        self.emit(ChangeEvent::MessagesChanged {
            chat_id: chat_id.clone(),
        });
        Ok(())
    }

    /// Adds the user to the emoji's reaction set, or removes them if already
    /// present; an emptied set drops its emoji key. Each user only moves
    /// their own id, so concurrent toggles commute.
    pub async fn toggle_reaction(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        emoji: &str,
        user_id: &UserId,
    ) -> StoreResult<Message> {
        if emoji.trim().is_empty() {
            return Err(StoreError::Validation("emoji must not be empty".into()));
        }

        // Immediate lock: a deferred transaction upgrading from the read
        // would fail with SQLITE_BUSY when two togglers race on a file
        // database.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT reactions FROM messages WHERE chat_id = ? AND id = ?",
        )
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(raw) = raw else {
            return Err(StoreError::NotFound(format!(
                "message {message_id} in chat {chat_id}"
            )));
        };

        let mut reactions: BTreeMap<String, BTreeSet<UserId>> = serde_json::from_str(&raw)?;
        let set = reactions.entry(emoji.to_string()).or_default();
        if !set.remove(user_id) {
            set.insert(user_id.clone());
        }
        if set.is_empty() {
            reactions.remove(emoji);
        }

        sqlx::query("UPDATE messages SET reactions = ? WHERE chat_id = ? AND id = ?")
            .bind(serde_json::to_string(&reactions)?)
            .bind(chat_id.as_str())
            .bind(message_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.emit(ChangeEvent::MessagesChanged {
            chat_id: chat_id.clone(),
        });
        self.fetch_message(chat_id, message_id).await
    }

    /// Unions the user into `read_by` for every listed message. Batched and
    /// idempotent; the set never shrinks.
    pub async fn mark_read(
        &self,
        chat_id: &ChatId,
        message_ids: &[MessageId],
        user_id: &UserId,
    ) -> StoreResult<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let mut changed = false;
        for message_id in message_ids {
            let raw: Option<String> =
                sqlx::query_scalar("SELECT read_by FROM messages WHERE chat_id = ? AND id = ?")
                    .bind(chat_id.as_str())
                    .bind(message_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some(raw) = raw else {
                continue;
            };
            let mut read_by: BTreeSet<UserId> = serde_json::from_str(&raw)?;
            if !read_by.insert(user_id.clone()) {
                continue;
            }
            sqlx::query("UPDATE messages SET read_by = ? WHERE chat_id = ? AND id = ?")
                .bind(serde_json::to_string(&read_by)?)
                .bind(chat_id.as_str())
                .bind(message_id.as_str())
                .execute(&mut *tx)
                .await?;
            changed = true;
        }
        tx.commit().await?;

        if changed {
            self.emit(ChangeEvent::MessagesChanged {
                chat_id: chat_id.clone(),
            });
        }
        Ok(())
    }

    /// One-shot backward page: messages strictly older than the cursor
    /// message, newest first. A short page means the chat is exhausted.
    pub async fn load_older(
        &self,
        chat_id: &ChatId,
        before: &MessageId,
        page_size: u32,
    ) -> StoreResult<PageSnapshot> {
        let cursor = sqlx::query(
            "SELECT created_at, seq FROM messages WHERE chat_id = ? AND id = ?",
        )
        .bind(chat_id.as_str())
        .bind(before.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!("cursor message {before} in chat {chat_id}"))
        })?;
        let cursor_created: String = cursor.get("created_at");
        let cursor_seq: i64 = cursor.get("seq");

        let rows = sqlx::query(
            "SELECT id, chat_id, sender_id, body, kind, attachments, reactions, read_by, moderation, created_at, edited_at, deleted_at
             FROM messages
             WHERE chat_id = ? AND (created_at < ? OR (created_at = ? AND seq < ?))
             ORDER BY created_at DESC, seq DESC
             LIMIT ?",
        )
        .bind(chat_id.as_str())
        .bind(&cursor_created)
        .bind(&cursor_created)
        .bind(cursor_seq)
        .bind(i64::from(page_size) + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as u32 > page_size;
        let mut messages = rows
            .into_iter()
            .map(row_to_message)
            .collect::<StoreResult<Vec<_>>>()?;
        messages.truncate(page_size as usize);
        Ok(PageSnapshot { messages, has_more })
    }

    /// Realtime subscription over the chat's newest `page_size` messages.
    /// Emits the full current window on every change; a query failure is
    /// reported as a notice while the consumer's last snapshot stays intact.
    pub fn subscribe_latest(&self, chat_id: ChatId, page_size: u32) -> Subscription<PageSnapshot> {
        let store = self.clone();
        let mut changes = self.events.subscribe();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let update = match store.latest_window(&chat_id, page_size).await {
                Ok(snapshot) => SubscriptionUpdate::Snapshot(snapshot),
                Err(error) => {
                    warn!(chat_id = %chat_id, %error, "initial message window query failed");
                    SubscriptionUpdate::Error(error.to_string())
                }
            };
            if tx.send(update).await.is_err() {
                return;
            }

            loop {
                match changes.recv().await {
                    Ok(event) if event.touches_messages(&chat_id) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(chat_id = %chat_id, skipped, "message change feed lagged; resyncing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                let update = match store.latest_window(&chat_id, page_size).await {
                    Ok(snapshot) => SubscriptionUpdate::Snapshot(snapshot),
                    Err(error) => {
                        warn!(chat_id = %chat_id, %error, "message window refresh failed; keeping last snapshot");
                        SubscriptionUpdate::Error(error.to_string())
                    }
                };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        Subscription::new(rx, task)
    }

    /// Current newest-first window, as one-shot read. Subscriptions re-run
    /// this on every relevant change.
    pub async fn latest_window(
        &self,
        chat_id: &ChatId,
        page_size: u32,
    ) -> StoreResult<PageSnapshot> {
        let rows = sqlx::query(
            "SELECT id, chat_id, sender_id, body, kind, attachments, reactions, read_by, moderation, created_at, edited_at, deleted_at
             FROM messages
             WHERE chat_id = ?
             ORDER BY created_at DESC, seq DESC
             LIMIT ?",
        )
        .bind(chat_id.as_str())
        .bind(i64::from(page_size) + 1)
        .fetch_all(&self.pool)
        .await?;

        let has_more = rows.len() as u32 > page_size;
        let mut messages = rows
            .into_iter()
            .map(row_to_message)
            .collect::<StoreResult<Vec<_>>>()?;
        messages.truncate(page_size as usize);
        Ok(PageSnapshot { messages, has_more })
    }

    pub(crate) async fn fetch_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> StoreResult<Message> {
        let row = sqlx::query(
            "SELECT id, chat_id, sender_id, body, kind, attachments, reactions, read_by, moderation, created_at, edited_at, deleted_at
             FROM messages WHERE chat_id = ? AND id = ?",
        )
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!("message {message_id} in chat {chat_id}"))
        })?;
        row_to_message(row)
    }
}

fn encode_kind(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Text => "text",
        MessageKind::Image => "image",
        MessageKind::Video => "video",
        MessageKind::File => "file",
        MessageKind::System => "system",
    }
}

fn decode_kind(raw: &str) -> StoreResult<MessageKind> {
    match raw {
        "text" => Ok(MessageKind::Text),
        "image" => Ok(MessageKind::Image),
        "video" => Ok(MessageKind::Video),
        "file" => Ok(MessageKind::File),
        "system" => Ok(MessageKind::System),
        other => Err(StoreError::Corrupt(format!("unknown message kind '{other}'"))),
    }
}

fn row_to_message(row: SqliteRow) -> StoreResult<Message> {
    let deleted_at = decode_instant_opt(row.get::<Option<String>, _>("deleted_at"))?;

    // Deleted messages keep their stored content for audit but must never
    // expose it through a read.
    let (text, attachments) = if deleted_at.is_some() {
        (None, Vec::new())
    } else {
        (
            row.get::<Option<String>, _>("body"),
            serde_json::from_str::<Vec<Attachment>>(&row.get::<String, _>("attachments"))?,
        )
    };

    Ok(Message {
        chat_id: ChatId::new(row.get::<String, _>("chat_id")),
        id: MessageRef::Confirmed(MessageId::new(row.get::<String, _>("id"))),
        sender_id: UserId::new(row.get::<String, _>("sender_id")),
        text,
        attachments,
        kind: decode_kind(&row.get::<String, _>("kind"))?,
        created_at: decode_instant(&row.get::<String, _>("created_at"))?,
        edited_at: decode_instant_opt(row.get::<Option<String>, _>("edited_at"))?,
        deleted_at,
        reactions: serde_json::from_str(&row.get::<String, _>("reactions"))?,
        read_by: serde_json::from_str(&row.get::<String, _>("read_by"))?,
        moderation: row
            .get::<Option<String>, _>("moderation")
            .map(|raw| serde_json::from_str::<ModerationVerdict>(&raw))
            .transpose()?,
    })
}
