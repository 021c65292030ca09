//! SQLite-backed realtime document store: durable chat/message/user/typing
//! collections plus a change feed that subscriptions re-query full window
//! snapshots from.

use std::collections::BTreeSet;
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use shared::domain::{ChatId, Message, UserId};

mod chats;
mod messages;
mod typing;
mod users;

pub use chats::NewGroupChat;
pub use messages::{NewMessage, PageSnapshot, DEFAULT_PAGE_SIZE};

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One entry in the store's change feed. Subscriptions use these only as a
/// re-query trigger; the fan-out worker additionally consumes the created
/// message and its participant hint.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    MessageCreated {
        message: Message,
        participants: BTreeSet<UserId>,
    },
    MessagesChanged {
        chat_id: ChatId,
    },
    ChatsChanged {
        chat_id: ChatId,
    },
    TypingChanged {
        chat_id: ChatId,
    },
    UsersChanged {
        user_id: UserId,
    },
}

impl ChangeEvent {
    pub fn touches_messages(&self, chat: &ChatId) -> bool {
        match self {
            ChangeEvent::MessageCreated { message, .. } => &message.chat_id == chat,
            ChangeEvent::MessagesChanged { chat_id } => chat_id == chat,
            _ => false,
        }
    }

    pub fn touches_chats(&self) -> bool {
        matches!(
            self,
            ChangeEvent::MessageCreated { .. } | ChangeEvent::ChatsChanged { .. }
        )
    }

    pub fn touches_typing(&self, chat: &ChatId) -> bool {
        matches!(self, ChangeEvent::TypingChanged { chat_id } if chat_id == chat)
    }
}

/// One subscription emission: a fresh full snapshot, or notice that a query
/// failed and the consumer's last snapshot is still the best known state.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate<T> {
    Snapshot(T),
    Error(String),
}

/// Handle to a realtime subscription task. Dropping it (or calling
/// [`Subscription::unsubscribe`]) stops all further emissions immediately.
pub struct Subscription<T> {
    rx: mpsc::Receiver<SubscriptionUpdate<T>>,
    task: JoinHandle<()>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::Receiver<SubscriptionUpdate<T>>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next update, or `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<SubscriptionUpdate<T>> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        // Drop aborts the task.
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Store {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Database)?
            .create_if_missing(true);
        // Every in-memory connection is its own database, so the pool must
        // not fan out when the url names one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, events })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Raw change feed, used by the notification fan-out worker.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ChangeEvent) {
        // No receivers is fine; the feed is best-effort.
        let _ = self.events.send(event);
    }
}

pub(crate) fn encode_instant(value: DateTime<Utc>) -> String {
    // Fixed-width micros keep lexicographic and chronological order aligned.
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_instant(raw: &str) -> StoreResult<DateTime<Utc>> {
    shared::time::to_instant(&serde_json::Value::String(raw.to_string()))
        .ok_or_else(|| StoreError::Corrupt(format!("unreadable timestamp '{raw}'")))
}

pub(crate) fn decode_instant_opt(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.map(|value| decode_instant(&value)).transpose()
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> StoreResult<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|error| {
        StoreError::Validation(format!(
            "failed to create parent directory '{}' for database url '{database_url}': {error}",
            parent.display()
        ))
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
