use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// Reserved prefix for client-synthesized message ids that have not been
/// confirmed by the store yet.
pub const PENDING_ID_PREFIX: &str = "optimistic-";

/// Identity of a not-yet-persisted message. The string form always carries
/// [`PENDING_ID_PREFIX`] so serialized ids stay distinguishable from
/// confirmed ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingId(String);

impl PendingId {
    pub fn generate() -> Self {
        Self(format!("{PENDING_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn parse(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        value.starts_with(PENDING_ID_PREFIX).then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message identity as a sum type: a pending entry is always superseded by a
/// confirmed one, never the other way around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageRef {
    Pending(PendingId),
    Confirmed(MessageId),
}

impl MessageRef {
    pub fn is_pending(&self) -> bool {
        matches!(self, MessageRef::Pending(_))
    }
}

impl From<String> for MessageRef {
    fn from(value: String) -> Self {
        match PendingId::parse(value.clone()) {
            Some(pending) => MessageRef::Pending(pending),
            None => MessageRef::Confirmed(MessageId(value)),
        }
    }
}

impl From<MessageRef> for String {
    fn from(value: MessageRef) -> Self {
        match value {
            MessageRef::Pending(id) => id.0,
            MessageRef::Confirmed(id) => id.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    File,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub status: ModerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Immutable once created; owned by exactly one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub storage_path: String,
    pub download_url: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub chat_id: ChatId,
    pub id: MessageRef,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub read_by: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation: Option<ModerationVerdict>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Dm,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub participants: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub muted_by: BTreeSet<UserId>,
}

/// Deterministic direct-message chat id: sort the two user ids and join
/// them. Guarantees at most one dm chat per unordered pair.
pub fn dm_chat_id(a: &UserId, b: &UserId) -> ChatId {
    let (low, high) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    ChatId(format!("{}_{}", low.0, high.0))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingState {
    pub user_id: UserId,
    pub typing: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub push_tokens: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dm_chat_id_is_order_independent() {
        let a = UserId::new("zed");
        let b = UserId::new("amy");
        assert_eq!(dm_chat_id(&a, &b), dm_chat_id(&b, &a));
        assert_eq!(dm_chat_id(&a, &b).0, "amy_zed");
    }

    #[test]
    fn message_ref_round_trips_through_string_form() {
        let pending = PendingId::generate();
        assert!(pending.as_str().starts_with(PENDING_ID_PREFIX));

        let parsed = MessageRef::from(pending.as_str().to_string());
        assert_eq!(parsed, MessageRef::Pending(pending));

        let confirmed = MessageRef::from("msg-42".to_string());
        assert_eq!(confirmed, MessageRef::Confirmed(MessageId::new("msg-42")));
        assert!(!confirmed.is_pending());
    }

    #[test]
    fn pending_id_rejects_unprefixed_input() {
        assert!(PendingId::parse("msg-42").is_none());
    }
}
