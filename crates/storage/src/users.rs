//! User directory: profile upserts, batch lookup, prefix search, presence,
//! and push-registration tokens.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use shared::domain::{User, UserId};

use crate::{decode_instant_opt, encode_instant, ChangeEvent, Store, StoreError, StoreResult};

/// Upper bound for a prefix range: everything starting with `term` sorts
/// below `term` + the highest code point.
fn prefix_upper_bound(term: &str) -> String {
    format!("{term}\u{10FFFF}")
}

impl Store {
    pub async fn upsert_user(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, email, display_name, photo_url, is_online, last_seen, push_tokens)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                photo_url = excluded.photo_url,
                is_online = excluded.is_online,
                last_seen = excluded.last_seen,
                push_tokens = excluded.push_tokens",
        )
        .bind(user.id.as_str())
        .bind(&user.email)
        .bind(user.display_name.as_deref())
        .bind(user.photo_url.as_deref())
        .bind(user.is_online)
        .bind(user.last_seen.map(encode_instant))
        .bind(serde_json::to_string(&user.push_tokens)?)
        .execute(&self.pool)
        .await?;

        self.emit(ChangeEvent::UsersChanged {
            user_id: user.id.clone(),
        });
        Ok(())
    }

    /// Batch lookup for the roster's directory cache. Unknown ids are simply
    /// absent from the result.
    pub async fn get_users(&self, ids: &[UserId]) -> StoreResult<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, email, display_name, photo_url, is_online, last_seen, push_tokens
             FROM users WHERE id IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_user).collect()
    }

    /// Search-as-you-type over display name or email using prefix ranges.
    pub async fn search_users(&self, term: &str, limit: u32) -> StoreResult<Vec<User>> {
        let term = term.trim();
        if term.is_empty() {
            return Err(StoreError::Validation("search term must not be empty".into()));
        }

        let upper = prefix_upper_bound(term);
        let rows = sqlx::query(
            "SELECT id, email, display_name, photo_url, is_online, last_seen, push_tokens
             FROM users
             WHERE (display_name >= ? AND display_name < ?) OR (email >= ? AND email < ?)
             ORDER BY COALESCE(display_name, email) ASC
             LIMIT ?",
        )
        .bind(term)
        .bind(&upper)
        .bind(term)
        .bind(&upper)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_user).collect()
    }

    pub async fn set_presence(
        &self,
        user_id: &UserId,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE id = ?")
            .bind(is_online)
            .bind(encode_instant(last_seen))
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        }

        self.emit(ChangeEvent::UsersChanged {
            user_id: user_id.clone(),
        });
        Ok(())
    }

    /// Unions a push-registration token into the user's set. The set grows
    /// only; stale tokens are the push service's problem.
    pub async fn add_push_token(&self, user_id: &UserId, token: &str) -> StoreResult<()> {
        let raw: Option<String> = sqlx::query_scalar("SELECT push_tokens FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(raw) = raw else {
            return Err(StoreError::NotFound(format!("user {user_id}")));
        };

        let mut tokens: BTreeSet<String> = serde_json::from_str(&raw)?;
        if tokens.insert(token.to_string()) {
            sqlx::query("UPDATE users SET push_tokens = ? WHERE id = ?")
                .bind(serde_json::to_string(&tokens)?)
                .bind(user_id.as_str())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn push_tokens_for(&self, ids: &[UserId]) -> StoreResult<Vec<String>> {
        let users = self.get_users(ids).await?;
        Ok(users
            .into_iter()
            .flat_map(|user| user.push_tokens.into_iter())
            .collect())
    }
}

fn row_to_user(row: SqliteRow) -> StoreResult<User> {
    Ok(User {
        id: UserId::new(row.get::<String, _>("id")),
        email: row.get::<String, _>("email"),
        display_name: row.get::<Option<String>, _>("display_name"),
        photo_url: row.get::<Option<String>, _>("photo_url"),
        is_online: row.get::<bool, _>("is_online"),
        last_seen: decode_instant_opt(row.get::<Option<String>, _>("last_seen"))?,
        push_tokens: serde_json::from_str(&row.get::<String, _>("push_tokens"))?,
    })
}
