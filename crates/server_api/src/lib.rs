//! Server-side request handlers: presence writes, push-token registration,
//! and the AI assist endpoints, all gated by the injected rate limiter.
//! Transport-agnostic; the HTTP layer adapts these to routes.

use std::sync::Arc;
use std::time::Duration;

use shared::assist::{Assistant, ModerationOutcome};
use shared::domain::{Chat, ChatId, Message, UserId};
use shared::error::{ApiError, ErrorCode};
use storage::{Store, StoreError};

pub mod fanout;
pub mod rate_limit;

pub use fanout::{spawn_fanout_worker, HttpPushSender, LoggingPushSender, PushPayload, PushSender};
pub use rate_limit::{FixedWindowLimiter, RateLimiter};

/// Assist endpoints share one budget per caller.
pub const ASSIST_WINDOW: Duration = Duration::from_secs(60);
pub const ASSIST_MAX_REQUESTS: u32 = 10;
/// Presence pings arrive on every visibility change; the budget is loose.
pub const PRESENCE_WINDOW: Duration = Duration::from_secs(60);
pub const PRESENCE_MAX_REQUESTS: u32 = 120;

/// How much recent history one summary request reads.
const SUMMARY_WINDOW: u32 = 50;

#[derive(Clone)]
pub struct ApiContext {
    pub store: Store,
    pub limiter: Arc<dyn RateLimiter>,
    pub assistant: Arc<dyn Assistant>,
}

pub async fn update_presence(
    ctx: &ApiContext,
    user_id: &UserId,
    status: &str,
) -> Result<(), ApiError> {
    assert_allowed(
        ctx,
        &format!("presence:{user_id}"),
        PRESENCE_WINDOW,
        PRESENCE_MAX_REQUESTS,
    )?;

    let is_online = match status {
        "online" => true,
        "away" | "offline" => false,
        other => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("unknown presence status '{other}'"),
            ));
        }
    };

    match ctx
        .store
        .set_presence(user_id, is_online, chrono::Utc::now())
        .await
    {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound(message)) => Err(ApiError::new(ErrorCode::NotFound, message)),
        Err(error) => Err(internal(error)),
    }
}

pub async fn register_push_token(
    ctx: &ApiContext,
    user_id: &UserId,
    token: &str,
) -> Result<(), ApiError> {
    if token.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "push token must not be empty",
        ));
    }
    match ctx.store.add_push_token(user_id, token).await {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound(message)) => Err(ApiError::new(ErrorCode::NotFound, message)),
        Err(error) => Err(internal(error)),
    }
}

/// Summarizes the chat's recent window for a participant.
pub async fn summarize_chat(
    ctx: &ApiContext,
    user_id: &UserId,
    chat_id: &ChatId,
) -> Result<String, ApiError> {
    assert_allowed(
        ctx,
        &format!("summarize:{user_id}"),
        ASSIST_WINDOW,
        ASSIST_MAX_REQUESTS,
    )?;
    ensure_participant(ctx, chat_id, user_id).await?;

    let window = ctx
        .store
        .latest_window(chat_id, SUMMARY_WINDOW)
        .await
        .map_err(internal)?;
    let transcript = transcript_of(&window.messages);
    Ok(ctx.assistant.summarize(&transcript).await.map_err(ApiError::from)?)
}

/// Suggests replies to the chat's newest readable message.
pub async fn draft_reply(
    ctx: &ApiContext,
    user_id: &UserId,
    chat_id: &ChatId,
) -> Result<Vec<String>, ApiError> {
    assert_allowed(
        ctx,
        &format!("draft:{user_id}"),
        ASSIST_WINDOW,
        ASSIST_MAX_REQUESTS,
    )?;
    ensure_participant(ctx, chat_id, user_id).await?;

    let window = ctx
        .store
        .latest_window(chat_id, SUMMARY_WINDOW)
        .await
        .map_err(internal)?;
    let last_text = window
        .messages
        .iter()
        .find_map(|message| message.text.clone())
        .ok_or_else(|| ApiError::new(ErrorCode::Validation, "no message to reply to"))?;

    Ok(ctx
        .assistant
        .draft_reply(&last_text)
        .await
        .map_err(ApiError::from)?)
}

pub async fn moderate_text(
    ctx: &ApiContext,
    user_id: &UserId,
    text: &str,
) -> Result<ModerationOutcome, ApiError> {
    assert_allowed(
        ctx,
        &format!("moderate:{user_id}"),
        ASSIST_WINDOW,
        ASSIST_MAX_REQUESTS,
    )?;
    Ok(ctx.assistant.moderate(text).await.map_err(ApiError::from)?)
}

async fn ensure_participant(
    ctx: &ApiContext,
    chat_id: &ChatId,
    user_id: &UserId,
) -> Result<Chat, ApiError> {
    let chat = ctx
        .store
        .get_chat(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("chat {chat_id} not found")))?;
    if !chat.participants.contains(user_id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a participant",
        ));
    }
    Ok(chat)
}

fn assert_allowed(
    ctx: &ApiContext,
    key: &str,
    window: Duration,
    max_requests: u32,
) -> Result<(), ApiError> {
    ctx.limiter
        .check(key, window, max_requests)
        .map_err(|rejected| ApiError::new(ErrorCode::RateLimited, rejected.to_string()))
}

fn transcript_of(window_desc: &[Message]) -> String {
    let mut lines: Vec<String> = window_desc
        .iter()
        .rev()
        .filter(|message| !message.is_deleted())
        .filter_map(|message| {
            message
                .text
                .as_ref()
                .map(|text| format!("{}: {text}", message.sender_id))
        })
        .collect();
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines.join("\n")
}

fn internal(error: StoreError) -> ApiError {
    ApiError::new(ErrorCode::Internal, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use shared::assist::StubAssistant;
    use shared::domain::MessageKind;
    use storage::NewMessage;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    async fn setup() -> (ApiContext, ChatId) {
        let store = Store::new("sqlite::memory:").await.expect("db");
        let chat = store
            .create_dm_chat(&user("alice"), &user("bob"))
            .await
            .expect("chat");
        let ctx = ApiContext {
            store,
            limiter: Arc::new(FixedWindowLimiter::new()),
            assistant: Arc::new(StubAssistant),
        };
        (ctx, chat.id)
    }

    async fn say(ctx: &ApiContext, chat_id: &ChatId, sender: &str, text: &str) {
        ctx.store
            .create_message(NewMessage {
                chat_id: chat_id.clone(),
                sender_id: user(sender),
                text: Some(text.to_string()),
                attachments: Vec::new(),
                kind: MessageKind::Text,
                participants: Default::default(),
                moderation: None,
            })
            .await
            .expect("message");
    }

    #[tokio::test]
    async fn non_participant_cannot_use_assist_endpoints() {
        let (ctx, chat_id) = setup().await;
        let err = summarize_chat(&ctx, &user("mallory"), &chat_id)
            .await
            .expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::Forbidden));

        let err = draft_reply(&ctx, &user("mallory"), &chat_id)
            .await
            .expect_err("should fail");
        assert!(matches!(err.code, ErrorCode::Forbidden));
    }

    #[tokio::test]
    async fn summary_reads_the_recent_window() {
        let (ctx, chat_id) = setup().await;
        say(&ctx, &chat_id, "alice", "hi").await;
        say(&ctx, &chat_id, "bob", "hey").await;

        let summary = summarize_chat(&ctx, &user("alice"), &chat_id)
            .await
            .expect("summary");
        assert!(summary.contains("2 messages"));
    }

    #[tokio::test]
    async fn draft_reply_targets_the_newest_text() {
        let (ctx, chat_id) = setup().await;
        let err = draft_reply(&ctx, &user("alice"), &chat_id)
            .await
            .expect_err("empty chat");
        assert!(matches!(err.code, ErrorCode::Validation));

        say(&ctx, &chat_id, "bob", "lunch at noon?").await;
        let suggestions = draft_reply(&ctx, &user("alice"), &chat_id)
            .await
            .expect("suggestions");
        assert!(!suggestions.is_empty());
    }

    #[tokio::test]
    async fn assist_calls_are_rate_limited_per_caller() {
        let (ctx, _) = setup().await;
        for _ in 0..ASSIST_MAX_REQUESTS {
            moderate_text(&ctx, &user("alice"), "fine").await.expect("allowed");
        }
        let err = moderate_text(&ctx, &user("alice"), "fine")
            .await
            .expect_err("over limit");
        assert!(matches!(err.code, ErrorCode::RateLimited));

        // A different caller is unaffected.
        moderate_text(&ctx, &user("bob"), "fine").await.expect("allowed");
    }

    #[tokio::test]
    async fn presence_validates_status_and_existence() {
        let (ctx, _) = setup().await;
        ctx.store
            .upsert_user(&shared::domain::User {
                id: user("alice"),
                email: "alice@example.com".into(),
                display_name: None,
                photo_url: None,
                is_online: false,
                last_seen: None,
                push_tokens: Default::default(),
            })
            .await
            .expect("user");

        update_presence(&ctx, &user("alice"), "online")
            .await
            .expect("online");
        let fetched = ctx.store.get_users(&[user("alice")]).await.expect("get");
        assert!(fetched[0].is_online);

        let err = update_presence(&ctx, &user("alice"), "busy")
            .await
            .expect_err("unknown status");
        assert!(matches!(err.code, ErrorCode::Validation));

        let err = update_presence(&ctx, &user("ghost"), "online")
            .await
            .expect_err("unknown user");
        assert!(matches!(err.code, ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn push_token_registration_requires_a_known_user() {
        let (ctx, _) = setup().await;
        let err = register_push_token(&ctx, &user("ghost"), "tok")
            .await
            .expect_err("unknown user");
        assert!(matches!(err.code, ErrorCode::NotFound));

        let err = register_push_token(&ctx, &user("ghost"), "  ")
            .await
            .expect_err("blank token");
        assert!(matches!(err.code, ErrorCode::Validation));
    }
}
