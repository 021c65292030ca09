//! Chat collection: deterministic dm creation, group/lobby creation, mute
//! flags, and the roster-side realtime subscription.

use std::collections::BTreeSet;

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use shared::domain::{dm_chat_id, Chat, ChatId, ChatKind, UserId};

use crate::{
    decode_instant, decode_instant_opt, encode_instant, ChangeEvent, Store, StoreError,
    StoreResult, Subscription, SubscriptionUpdate,
};

#[derive(Debug, Clone)]
pub struct NewGroupChat {
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub participants: BTreeSet<UserId>,
}

impl Store {
    /// Creates (or returns) the unique dm chat for an unordered user pair.
    /// The deterministic id makes the insert a no-op when the pair raced.
    pub async fn create_dm_chat(&self, a: &UserId, b: &UserId) -> StoreResult<Chat> {
        if a == b {
            return Err(StoreError::Validation(
                "direct message chat needs two distinct users".into(),
            ));
        }

        let id = dm_chat_id(a, b);
        let now = encode_instant(Utc::now());
        let participants: BTreeSet<UserId> = [a.clone(), b.clone()].into();
        let inserted = sqlx::query(
            "INSERT INTO chats (id, kind, participants, created_at, updated_at)
             VALUES (?, 'dm', ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(serde_json::to_string(&participants)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            self.emit(ChangeEvent::ChatsChanged { chat_id: id.clone() });
        }
        self.fetch_chat(&id).await
    }

    pub async fn create_group_chat(&self, new: NewGroupChat) -> StoreResult<Chat> {
        if new.participants.len() < 2 {
            return Err(StoreError::Validation(
                "group chat needs at least two participants".into(),
            ));
        }

        let id = ChatId::new(Uuid::new_v4().to_string());
        let now = encode_instant(Utc::now());
        sqlx::query(
            "INSERT INTO chats (id, kind, participants, name, description, avatar_url, created_at, updated_at)
             VALUES (?, 'group', ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(serde_json::to_string(&new.participants)?)
        .bind(new.name.as_deref())
        .bind(new.description.as_deref())
        .bind(new.avatar_url.as_deref())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.emit(ChangeEvent::ChatsChanged { chat_id: id.clone() });
        self.fetch_chat(&id).await
    }

    /// Ensures the shared lobby chat exists and contains `joiner`. The happy
    /// path is a single transaction; if that transaction fails, a
    /// best-effort non-atomic merge runs instead, which can lose a
    /// concurrent join. Accepted and logged, never surfaced.
    pub async fn create_lobby_chat(
        &self,
        lobby_id: &ChatId,
        name: &str,
        joiner: &UserId,
    ) -> StoreResult<Chat> {
        match self.lobby_join_tx(lobby_id, name, joiner).await {
            Ok(()) => {}
            Err(error) => {
                warn!(chat_id = %lobby_id, %error, "lobby join transaction failed; falling back to non-atomic merge");
                self.lobby_join_fallback(lobby_id, name, joiner).await?;
            }
        }

        self.emit(ChangeEvent::ChatsChanged {
            chat_id: lobby_id.clone(),
        });
        self.fetch_chat(lobby_id).await
    }

    async fn lobby_join_tx(
        &self,
        lobby_id: &ChatId,
        name: &str,
        joiner: &UserId,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let now = encode_instant(Utc::now());

        let existing: Option<String> =
            sqlx::query_scalar("SELECT participants FROM chats WHERE id = ?")
                .bind(lobby_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some(raw) => {
                let mut participants: BTreeSet<UserId> = serde_json::from_str(&raw)?;
                if participants.insert(joiner.clone()) {
                    sqlx::query("UPDATE chats SET participants = ?, updated_at = ? WHERE id = ?")
                        .bind(serde_json::to_string(&participants)?)
                        .bind(&now)
                        .bind(lobby_id.as_str())
                        .execute(&mut *tx)
                        .await?;
                }
            }
            None => {
                let participants: BTreeSet<UserId> = [joiner.clone()].into();
                sqlx::query(
                    "INSERT INTO chats (id, kind, participants, name, created_at, updated_at)
                     VALUES (?, 'group', ?, ?, ?, ?)",
                )
                .bind(lobby_id.as_str())
                .bind(serde_json::to_string(&participants)?)
                .bind(name)
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn lobby_join_fallback(
        &self,
        lobby_id: &ChatId,
        name: &str,
        joiner: &UserId,
    ) -> StoreResult<()> {
        let now = encode_instant(Utc::now());
        let participants: BTreeSet<UserId> = [joiner.clone()].into();
        sqlx::query(
            "INSERT INTO chats (id, kind, participants, name, created_at, updated_at)
             VALUES (?, 'group', ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(lobby_id.as_str())
        .bind(serde_json::to_string(&participants)?)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        // Read-modify-write outside a transaction; a join racing this window
        // can be dropped.
        let raw: String = sqlx::query_scalar("SELECT participants FROM chats WHERE id = ?")
            .bind(lobby_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        let mut merged: BTreeSet<UserId> = serde_json::from_str(&raw)?;
        if merged.insert(joiner.clone()) {
            sqlx::query("UPDATE chats SET participants = ?, updated_at = ? WHERE id = ?")
                .bind(serde_json::to_string(&merged)?)
                .bind(&now)
                .bind(lobby_id.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn set_chat_muted(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        muted: bool,
    ) -> StoreResult<()> {
        let raw: Option<String> = sqlx::query_scalar("SELECT muted_by FROM chats WHERE id = ?")
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(raw) = raw else {
            return Err(StoreError::NotFound(format!("chat {chat_id}")));
        };

        let mut muted_by: BTreeSet<UserId> = serde_json::from_str(&raw)?;
        let changed = if muted {
            muted_by.insert(user_id.clone())
        } else {
            muted_by.remove(user_id)
        };
        if changed {
            sqlx::query("UPDATE chats SET muted_by = ? WHERE id = ?")
                .bind(serde_json::to_string(&muted_by)?)
                .bind(chat_id.as_str())
                .execute(&self.pool)
                .await?;
            self.emit(ChangeEvent::ChatsChanged {
                chat_id: chat_id.clone(),
            });
        }
        Ok(())
    }

    pub async fn get_chat(&self, chat_id: &ChatId) -> StoreResult<Option<Chat>> {
        let row = sqlx::query(
            "SELECT id, kind, participants, name, description, avatar_url, last_message, last_message_at, muted_by, created_at, updated_at
             FROM chats WHERE id = ?",
        )
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_chat).transpose()
    }

    /// All chats the user participates in; the roster aggregator sorts.
    pub async fn chats_for_user(&self, user_id: &UserId) -> StoreResult<Vec<Chat>> {
        let rows = sqlx::query(
            "SELECT id, kind, participants, name, description, avatar_url, last_message, last_message_at, muted_by, created_at, updated_at
             FROM chats
             WHERE EXISTS (SELECT 1 FROM json_each(chats.participants) WHERE json_each.value = ?)",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_chat).collect()
    }

    /// Realtime subscription over the user's chat set. Full set per
    /// emission; a query failure is reported as a notice while the
    /// consumer's last snapshot stays intact.
    pub fn subscribe_chats(&self, user_id: UserId) -> Subscription<Vec<Chat>> {
        let store = self.clone();
        let mut changes = self.events.subscribe();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let update = match store.chats_for_user(&user_id).await {
                Ok(chats) => SubscriptionUpdate::Snapshot(chats),
                Err(error) => {
                    warn!(user_id = %user_id, %error, "initial chat roster query failed");
                    SubscriptionUpdate::Error(error.to_string())
                }
            };
            if tx.send(update).await.is_err() {
                return;
            }

            loop {
                match changes.recv().await {
                    Ok(event) if event.touches_chats() => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(user_id = %user_id, skipped, "chat change feed lagged; resyncing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                let update = match store.chats_for_user(&user_id).await {
                    Ok(chats) => SubscriptionUpdate::Snapshot(chats),
                    Err(error) => {
                        warn!(user_id = %user_id, %error, "chat roster refresh failed; keeping last snapshot");
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

    async fn fetch_chat(&self, chat_id: &ChatId) -> StoreResult<Chat> {
        self.get_chat(chat_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("chat {chat_id}")))
    }
}

fn row_to_chat(row: SqliteRow) -> StoreResult<Chat> {
    let kind = match row.get::<String, _>("kind").as_str() {
        "dm" => ChatKind::Dm,
        "group" => ChatKind::Group,
        other => {
            return Err(StoreError::Corrupt(format!("unknown chat kind '{other}'")));
        }
    };

    Ok(Chat {
        id: ChatId::new(row.get::<String, _>("id")),
        kind,
        participants: serde_json::from_str(&row.get::<String, _>("participants"))?,
        name: row.get::<Option<String>, _>("name"),
        description: row.get::<Option<String>, _>("description"),
        avatar_url: row.get::<Option<String>, _>("avatar_url"),
        created_at: decode_instant(&row.get::<String, _>("created_at"))?,
        updated_at: decode_instant(&row.get::<String, _>("updated_at"))?,
        last_message: row.get::<Option<String>, _>("last_message"),
        last_message_at: decode_instant_opt(row.get::<Option<String>, _>("last_message_at"))?,
        muted_by: serde_json::from_str(&row.get::<String, _>("muted_by"))?,
    })
}
