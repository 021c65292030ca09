//! Per-chat ephemeral typing flags, independent of message persistence.
//! There is no server-enforced expiry; readers get `updated_at` and may
//! apply their own staleness rule.

use std::collections::BTreeMap;

use chrono::Utc;
use sqlx::Row;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use shared::domain::{ChatId, TypingState, UserId};

use crate::{
    decode_instant, encode_instant, ChangeEvent, Store, StoreResult, Subscription,
    SubscriptionUpdate,
};

impl Store {
    /// Merge-upsert of the caller's typing flag; owned by the writing user.
    pub async fn upsert_typing(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        typing: bool,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO typing (chat_id, user_id, typing, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id, user_id) DO UPDATE SET typing = excluded.typing, updated_at = excluded.updated_at",
        )
        .bind(chat_id.as_str())
        .bind(user_id.as_str())
        .bind(typing)
        .bind(encode_instant(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.emit(ChangeEvent::TypingChanged {
            chat_id: chat_id.clone(),
        });
        Ok(())
    }

    pub async fn typing_snapshot(
        &self,
        chat_id: &ChatId,
    ) -> StoreResult<BTreeMap<UserId, TypingState>> {
        let rows = sqlx::query("SELECT user_id, typing, updated_at FROM typing WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let user_id = UserId::new(row.get::<String, _>("user_id"));
            snapshot.insert(
                user_id.clone(),
                TypingState {
                    user_id,
                    typing: row.get::<bool, _>("typing"),
                    updated_at: decode_instant(&row.get::<String, _>("updated_at"))?,
                },
            );
        }
        Ok(snapshot)
    }

    pub fn subscribe_typing(
        &self,
        chat_id: ChatId,
    ) -> Subscription<BTreeMap<UserId, TypingState>> {
        let store = self.clone();
        let mut changes = self.events.subscribe();
        let (tx, rx) = mpsc::channel(16);

        let task = tokio::spawn(async move {
            let update = match store.typing_snapshot(&chat_id).await {
                Ok(snapshot) => SubscriptionUpdate::Snapshot(snapshot),
                Err(error) => {
                    warn!(chat_id = %chat_id, %error, "initial typing query failed");
                    SubscriptionUpdate::Error(error.to_string())
                }
            };
            if tx.send(update).await.is_err() {
                return;
            }

            loop {
                match changes.recv().await {
                    Ok(event) if event.touches_typing(&chat_id) => {}
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(chat_id = %chat_id, skipped, "typing change feed lagged; resyncing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                let update = match store.typing_snapshot(&chat_id).await {
                    Ok(snapshot) => SubscriptionUpdate::Snapshot(snapshot),
                    Err(error) => {
                        warn!(chat_id = %chat_id, %error, "typing refresh failed; keeping last snapshot");
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
}
