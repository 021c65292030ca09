//! Presence and typing: debounced typing writes and best-effort presence
//! updates. Every write path here logs failures instead of surfacing them.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use shared::domain::{ChatId, TypingState, UserId};
use storage::Store;

pub const TYPING_QUIET_INTERVAL: Duration = Duration::from_secs(2);

/// Collapses a burst of input events into one `typing=true` write followed
/// by a single `typing=false` write after the quiet interval passes with no
/// further input.
pub struct TypingPublisher {
    input_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl TypingPublisher {
    pub fn new(store: Store, chat_id: ChatId, user_id: UserId) -> Self {
        Self::with_quiet_interval(store, chat_id, user_id, TYPING_QUIET_INTERVAL)
    }

    pub fn with_quiet_interval(
        store: Store,
        chat_id: ChatId,
        user_id: UserId,
        quiet: Duration,
    ) -> Self {
        let (input_tx, mut input_rx) = mpsc::channel::<()>(16);
        let task = tokio::spawn(async move {
            'bursts: while input_rx.recv().await.is_some() {
                write_typing(&store, &chat_id, &user_id, true).await;
                loop {
                    tokio::select! {
                        more = input_rx.recv() => {
                            if more.is_none() {
                                // Publisher dropped mid-burst; clear the flag
                                // before exiting.
                                write_typing(&store, &chat_id, &user_id, false).await;
                                break 'bursts;
                            }
                            // Further input extends the quiet window.
                        }
                        _ = tokio::time::sleep(quiet) => {
                            write_typing(&store, &chat_id, &user_id, false).await;
                            break;
                        }
                    }
                }
            }
        });

        Self { input_tx, task }
    }

    /// Reports one input event. Never blocks the caller on the store.
    pub async fn input(&self) {
        let _ = self.input_tx.send(()).await;
    }

    /// Drops the input side and waits for the final `typing=false` write.
    pub async fn finish(self) {
        drop(self.input_tx);
        let _ = self.task.await;
    }
}

async fn write_typing(store: &Store, chat_id: &ChatId, user_id: &UserId, typing: bool) {
    if let Err(error) = store.upsert_typing(chat_id, user_id, typing).await {
        warn!(chat_id = %chat_id, typing, %error, "typing write failed");
    }
}

/// Users currently typing, excluding the viewer.
pub fn active_typists(snapshot: &BTreeMap<UserId, TypingState>, viewer: &UserId) -> Vec<UserId> {
    snapshot
        .values()
        .filter(|state| state.typing && &state.user_id != viewer)
        .map(|state| state.user_id.clone())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }

    fn is_online(self) -> bool {
        matches!(self, PresenceStatus::Online)
    }
}

/// Mirrors visibility changes into the user record and, when configured,
/// an out-of-band presence endpoint for platforms where the final store
/// write may not complete.
pub struct PresenceTracker {
    store: Store,
    user_id: UserId,
    http: reqwest::Client,
    endpoint: Option<PresenceEndpoint>,
}

struct PresenceEndpoint {
    url: String,
    bearer_token: String,
}

impl PresenceTracker {
    pub fn new(store: Store, user_id: UserId) -> Self {
        Self {
            store,
            user_id,
            http: reqwest::Client::new(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        self.endpoint = Some(PresenceEndpoint {
            url: url.into(),
            bearer_token: bearer_token.into(),
        });
        self
    }

    /// Fire and forget. Both the store write and the endpoint ping log
    /// failures without surfacing them.
    pub async fn set_status(&self, status: PresenceStatus) {
        if let Err(error) = self
            .store
            .set_presence(&self.user_id, status.is_online(), Utc::now())
            .await
        {
            warn!(user_id = %self.user_id, status = status.as_str(), %error, "presence write failed");
        }

        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let request = self
            .http
            .post(&endpoint.url)
            .bearer_auth(&endpoint.bearer_token)
            .json(&serde_json::json!({ "status": status.as_str() }));
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(user_id = %user_id, status = %response.status(), "presence ping rejected");
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(user_id = %user_id, %error, "presence ping failed");
                }
            }
        });
    }
}
