//! Chat roster aggregation: the user's chat subscription denormalized into
//! display summaries, backed by a grow-only user directory cache.

use std::collections::HashMap;

use tracing::warn;

use shared::domain::{Chat, ChatKind, User, UserId};
use storage::{Store, Subscription, SubscriptionUpdate};

/// One roster row, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub chat: Chat,
    pub title: String,
    pub subtitle: String,
    pub avatar_url: Option<String>,
}

pub struct ChatRoster {
    store: Store,
    user_id: UserId,
    directory: HashMap<UserId, User>,
    subscription: Subscription<Vec<Chat>>,
    last: Vec<ChatSummary>,
    notice: Option<String>,
}

impl ChatRoster {
    pub fn new(store: &Store, user_id: UserId) -> Self {
        let subscription = store.subscribe_chats(user_id.clone());
        Self {
            store: store.clone(),
            user_id,
            directory: HashMap::new(),
            subscription,
            last: Vec::new(),
            notice: None,
        }
    }

    /// Next roster snapshot, or `None` once the feed is closed. Each
    /// emission lazily resolves participant identities it has not seen
    /// before; the cache never evicts within a session. A refresh failure
    /// returns the last good rows and records a notice.
    pub async fn next(&mut self) -> Option<Vec<ChatSummary>> {
        let chats = match self.subscription.recv().await? {
            SubscriptionUpdate::Snapshot(chats) => chats,
            SubscriptionUpdate::Error(notice) => {
                warn!(%notice, "chat roster refresh failed; keeping last rows");
                self.notice = Some(notice);
                return Some(self.last.clone());
            }
        };
        self.resolve_unknown_participants(&chats).await;

        let mut summaries: Vec<ChatSummary> =
            chats.iter().map(|chat| self.summarize(chat)).collect();
        summaries.sort_by_key(|summary| {
            std::cmp::Reverse(
                summary
                    .chat
                    .last_message_at
                    .unwrap_or(summary.chat.updated_at),
            )
        });
        self.last = summaries.clone();
        Some(summaries)
    }

    /// Latest subscription failure notice, cleared on read.
    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    async fn resolve_unknown_participants(&mut self, chats: &[Chat]) {
        let unknown: Vec<UserId> = chats
            .iter()
            .flat_map(|chat| chat.participants.iter())
            .filter(|id| !self.directory.contains_key(*id))
            .cloned()
            .collect();
        if unknown.is_empty() {
            return;
        }

        match self.store.get_users(&unknown).await {
            Ok(users) => {
                for user in users {
                    self.directory.insert(user.id.clone(), user);
                }
            }
            Err(error) => {
                // Stale titles beat a blank roster; retry on the next emission.
                warn!(%error, "participant directory fetch failed");
            }
        }
    }

    fn summarize(&self, chat: &Chat) -> ChatSummary {
        match chat.kind {
            ChatKind::Dm => self.summarize_dm(chat),
            ChatKind::Group => self.summarize_group(chat),
        }
    }

    fn summarize_dm(&self, chat: &Chat) -> ChatSummary {
        let counterpart = chat
            .participants
            .iter()
            .find(|id| **id != self.user_id)
            .and_then(|id| self.directory.get(id));

        let title = counterpart
            .map(display_or_email)
            .unwrap_or_else(|| "Direct message".to_string());
        let subtitle = chat
            .last_message
            .clone()
            .or_else(|| counterpart.map(|user| user.email.clone()))
            .unwrap_or_else(|| "Say hello".to_string());

        ChatSummary {
            chat: chat.clone(),
            title,
            subtitle,
            avatar_url: counterpart.and_then(|user| user.photo_url.clone()),
        }
    }

    fn summarize_group(&self, chat: &Chat) -> ChatSummary {
        let member_names = self.joined_member_names(chat);
        let title = chat
            .name
            .clone()
            .unwrap_or_else(|| member_names.clone());
        let subtitle = chat
            .last_message
            .clone()
            .unwrap_or_else(|| format!("Members: {member_names}"));

        ChatSummary {
            chat: chat.clone(),
            title,
            subtitle,
            avatar_url: chat.avatar_url.clone(),
        }
    }

    fn joined_member_names(&self, chat: &Chat) -> String {
        chat.participants
            .iter()
            .filter(|id| **id != self.user_id)
            .map(|id| match self.directory.get(id) {
                Some(user) => display_or_email(user),
                None => id.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn display_or_email(user: &User) -> String {
    user.display_name
        .clone()
        .unwrap_or_else(|| user.email.clone())
}
