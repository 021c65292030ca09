use super::*;

use std::collections::BTreeSet;

use shared::domain::{
    dm_chat_id, Attachment, ChatId, MessageId, MessageKind, MessageRef, User, UserId,
};

use crate::chats::NewGroupChat;
use crate::messages::NewMessage;

async fn store() -> Store {
    Store::new("sqlite::memory:").await.expect("db")
}

fn user(id: &str) -> UserId {
    UserId::new(id)
}

fn new_text_message(chat: &ChatId, sender: &UserId, text: &str) -> NewMessage {
    NewMessage {
        chat_id: chat.clone(),
        sender_id: sender.clone(),
        text: Some(text.to_string()),
        attachments: Vec::new(),
        kind: MessageKind::Text,
        participants: BTreeSet::new(),
        moderation: None,
    }
}

fn confirmed_id(message: &shared::domain::Message) -> MessageId {
    match &message.id {
        MessageRef::Confirmed(id) => id.clone(),
        MessageRef::Pending(id) => panic!("expected confirmed id, got pending {id}"),
    }
}

async fn next_snapshot<T>(sub: &mut Subscription<T>) -> T {
    match sub.recv().await.expect("emission") {
        SubscriptionUpdate::Snapshot(value) => value,
        SubscriptionUpdate::Error(notice) => panic!("unexpected error notice: {notice}"),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    store().await.health_check().await.expect("health check");
}

#[tokio::test]
async fn empty_chat_window_reports_no_more() {
    let store = store().await;
    let chat = ChatId::new("empty");

    let mut sub = store.subscribe_latest(chat, 40);
    let snapshot = next_snapshot(&mut sub).await;
    assert!(snapshot.messages.is_empty());
    assert!(!snapshot.has_more);
}

#[tokio::test]
async fn subscription_delivers_full_window_on_create() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");

    let mut sub = store.subscribe_latest(chat.clone(), 40);
    let initial = next_snapshot(&mut sub).await;
    assert!(initial.messages.is_empty());

    let created = store
        .create_message(new_text_message(&chat, &alice, "Hello there"))
        .await
        .expect("create");

    let snapshot = next_snapshot(&mut sub).await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, created.id);
    assert_eq!(snapshot.messages[0].text.as_deref(), Some("Hello there"));
}

#[tokio::test]
async fn unsubscribed_feed_stops_emitting() {
    let store = store().await;
    let chat = ChatId::new("room");

    let sub = store.subscribe_latest(chat.clone(), 10);
    sub.unsubscribe();

    // The writer must not observe a stuck channel.
    store
        .create_message(new_text_message(&chat, &user("alice"), "still works"))
        .await
        .expect("create after unsubscribe");
}

#[tokio::test]
async fn load_older_walks_history_exactly_once() {
    let store = store().await;
    let chat = ChatId::new("history");
    let alice = user("alice");

    let mut ids = Vec::new();
    for i in 0..5 {
        let created = store
            .create_message(new_text_message(&chat, &alice, &format!("m{i}")))
            .await
            .expect("create");
        ids.push(confirmed_id(&created));
    }

    let window = store.latest_window(&chat, 2).await.expect("window");
    assert_eq!(window.messages.len(), 2);
    assert!(window.has_more);
    let cursor_instant = window.messages[1].created_at;

    let mut seen: Vec<MessageId> = window.messages.iter().map(confirmed_id).collect();
    let mut cursor = seen.last().cloned().expect("cursor");
    loop {
        let page = store.load_older(&chat, &cursor, 2).await.expect("page");
        for message in &page.messages {
            assert!(message.created_at <= cursor_instant);
            seen.push(confirmed_id(message));
        }
        if !page.has_more {
            break;
        }
        cursor = seen.last().cloned().expect("cursor");
    }

    // Window plus pages cover every message exactly once.
    let unique: BTreeSet<_> = seen.iter().cloned().collect();
    assert_eq!(unique.len(), ids.len());
    assert_eq!(seen.len(), ids.len());
}

#[tokio::test]
async fn load_older_with_unknown_cursor_fails() {
    let store = store().await;
    let chat = ChatId::new("history");
    let result = store
        .load_older(&chat, &MessageId::new("missing"), 10)
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn edit_rejects_blank_text_and_stamps_edited_at() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");
    let created = store
        .create_message(new_text_message(&chat, &alice, "typo"))
        .await
        .expect("create");
    let id = confirmed_id(&created);

    let rejected = store.edit_message(&chat, &id, "   ").await;
    assert!(matches!(rejected, Err(StoreError::Validation(_))));

    let edited = store.edit_message(&chat, &id, "fixed").await.expect("edit");
    assert_eq!(edited.text.as_deref(), Some("fixed"));
    assert!(edited.edited_at.is_some());
    assert_eq!(edited.attachments, created.attachments);
}

#[tokio::test]
async fn soft_deleted_message_hides_text_and_attachments() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");
    let created = store
        .create_message(NewMessage {
            attachments: vec![Attachment {
                id: "att-1".into(),
                storage_path: "chats/room/att-1".into(),
                download_url: "https://files.example/att-1".into(),
                content_type: "image/png".into(),
                size_bytes: 2048,
                display_name: "photo.png".into(),
                width: Some(640),
                height: Some(480),
                duration_ms: None,
            }],
            kind: MessageKind::Image,
            ..new_text_message(&chat, &alice, "look at this")
        })
        .await
        .expect("create");
    let id = confirmed_id(&created);

    store
        .soft_delete_message(&chat, &id)
        .await
        .expect("soft delete");

    let fetched = store.fetch_message(&chat, &id).await.expect("fetch");
    assert!(fetched.deleted_at.is_some());
    assert_eq!(fetched.text, None);
    assert!(fetched.attachments.is_empty());

    let window = store.latest_window(&chat, 10).await.expect("window");
    assert_eq!(window.messages[0].text, None);
    assert!(window.messages[0].attachments.is_empty());

    // Editing a deleted message is a hard failure.
    let edit = store.edit_message(&chat, &id, "resurrect").await;
    assert!(matches!(edit, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn reaction_toggle_is_its_own_inverse() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");
    let created = store
        .create_message(new_text_message(&chat, &alice, "react to me"))
        .await
        .expect("create");
    let id = confirmed_id(&created);

    let reacted = store
        .toggle_reaction(&chat, &id, "👍", &alice)
        .await
        .expect("toggle on");
    assert!(reacted.reactions["👍"].contains(&alice));

    let reverted = store
        .toggle_reaction(&chat, &id, "👍", &alice)
        .await
        .expect("toggle off");
    // The emptied emoji key is removed entirely.
    assert!(!reverted.reactions.contains_key("👍"));
    assert_eq!(reverted.reactions, created.reactions);
}

#[tokio::test]
async fn concurrent_reactions_from_two_users_both_land() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");
    let bob = user("bob");
    let created = store
        .create_message(new_text_message(&chat, &alice, "popular"))
        .await
        .expect("create");
    let id = confirmed_id(&created);

    let a = store.toggle_reaction(&chat, &id, "👍", &alice);
    let b = store.toggle_reaction(&chat, &id, "👍", &bob);
    let (ra, rb) = tokio::join!(a, b);
    ra.expect("alice toggle");
    rb.expect("bob toggle");

    let fetched = store.fetch_message(&chat, &id).await.expect("fetch");
    assert!(fetched.reactions["👍"].contains(&alice));
    assert!(fetched.reactions["👍"].contains(&bob));
}

#[tokio::test]
async fn subscription_surfaces_query_failures_as_notices() {
    let store = store().await;
    sqlx::query("DROP TABLE messages")
        .execute(store.pool())
        .await
        .expect("drop");

    // The consumer must learn the initial query failed instead of waiting
    // for a snapshot that will never come.
    let mut sub = store.subscribe_latest(ChatId::new("room"), 10);
    match sub.recv().await.expect("emission") {
        SubscriptionUpdate::Error(notice) => assert!(!notice.is_empty()),
        SubscriptionUpdate::Snapshot(_) => panic!("expected an error notice"),
    }
}

#[tokio::test]
async fn concurrent_reactions_commute_on_file_databases() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("chat_storage_test_{suffix}"));
    std::fs::create_dir_all(&dir).expect("temp dir");
    let url = format!("sqlite://{}/store.db", dir.display());

    // A file url widens the pool, so the togglers really run on separate
    // connections here.
    let store = Store::new(&url).await.expect("db");
    let chat = ChatId::new("room");
    let alice = user("alice");
    let bob = user("bob");
    let created = store
        .create_message(new_text_message(&chat, &alice, "popular"))
        .await
        .expect("create");
    let id = confirmed_id(&created);

    let a = store.toggle_reaction(&chat, &id, "👍", &alice);
    let b = store.toggle_reaction(&chat, &id, "👍", &bob);
    let (ra, rb) = tokio::join!(a, b);
    ra.expect("alice toggle");
    rb.expect("bob toggle");

    let fetched = store.fetch_message(&chat, &id).await.expect("fetch");
    assert!(fetched.reactions["👍"].contains(&alice));
    assert!(fetched.reactions["👍"].contains(&bob));

    drop(store);
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn mark_read_is_idempotent_and_grows_only() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");
    let bob = user("bob");
    let first = confirmed_id(
        &store
            .create_message(new_text_message(&chat, &alice, "one"))
            .await
            .expect("create"),
    );
    let second = confirmed_id(
        &store
            .create_message(new_text_message(&chat, &alice, "two"))
            .await
            .expect("create"),
    );

    let batch = vec![first.clone(), second.clone()];
    store.mark_read(&chat, &batch, &bob).await.expect("mark");
    store
        .mark_read(&chat, &batch, &bob)
        .await
        .expect("mark again");

    let fetched = store.fetch_message(&chat, &first).await.expect("fetch");
    assert_eq!(fetched.read_by, BTreeSet::from([bob.clone()]));

    store
        .mark_read(&chat, &[first.clone()], &alice)
        .await
        .expect("mark by sender");
    let fetched = store.fetch_message(&chat, &first).await.expect("fetch");
    assert_eq!(fetched.read_by, BTreeSet::from([alice, bob]));
}

#[tokio::test]
async fn dm_chat_is_unique_per_unordered_pair() {
    let store = store().await;
    let alice = user("alice");
    let bob = user("bob");

    let ab = store.create_dm_chat(&alice, &bob).await.expect("dm");
    let ba = store.create_dm_chat(&bob, &alice).await.expect("dm");
    assert_eq!(ab.id, ba.id);
    assert_eq!(ab.id, dm_chat_id(&alice, &bob));

    let rosters = store.chats_for_user(&alice).await.expect("chats");
    assert_eq!(rosters.len(), 1);
}

#[tokio::test]
async fn dm_chat_rejects_self_pair() {
    let store = store().await;
    let alice = user("alice");
    let result = store.create_dm_chat(&alice, &alice).await;
    assert!(matches!(result, Err(StoreError::Validation(_))));
}

#[tokio::test]
async fn lobby_join_accumulates_participants() {
    let store = store().await;
    let lobby = ChatId::new("lobby");

    store
        .create_lobby_chat(&lobby, "Lobby", &user("alice"))
        .await
        .expect("first join");
    let joined = store
        .create_lobby_chat(&lobby, "Lobby", &user("bob"))
        .await
        .expect("second join");

    assert_eq!(joined.participants.len(), 2);
    assert!(joined.participants.contains(&user("alice")));
    assert!(joined.participants.contains(&user("bob")));
}

#[tokio::test]
async fn group_chat_requires_two_participants() {
    let store = store().await;
    let result = store
        .create_group_chat(NewGroupChat {
            name: Some("solo".into()),
            description: None,
            avatar_url: None,
            participants: BTreeSet::from([user("alice")]),
        })
        .await;
    assert!(matches!(result, Err(StoreError::Validation(_))));
}

#[tokio::test]
async fn mute_flag_round_trips() {
    let store = store().await;
    let alice = user("alice");
    let bob = user("bob");
    let chat = store.create_dm_chat(&alice, &bob).await.expect("dm");

    store
        .set_chat_muted(&chat.id, &bob, true)
        .await
        .expect("mute");
    let muted = store.get_chat(&chat.id).await.expect("get").expect("chat");
    assert!(muted.muted_by.contains(&bob));

    store
        .set_chat_muted(&chat.id, &bob, false)
        .await
        .expect("unmute");
    let unmuted = store.get_chat(&chat.id).await.expect("get").expect("chat");
    assert!(unmuted.muted_by.is_empty());
}

#[tokio::test]
async fn roster_subscription_sees_last_message_updates() {
    let store = store().await;
    let alice = user("alice");
    let bob = user("bob");
    let chat = store.create_dm_chat(&alice, &bob).await.expect("dm");

    let mut sub = store.subscribe_chats(alice.clone());
    let initial = next_snapshot(&mut sub).await;
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].last_message, None);

    store
        .create_message(new_text_message(&chat.id, &bob, "ping"))
        .await
        .expect("create");

    let updated = next_snapshot(&mut sub).await;
    assert_eq!(updated[0].last_message.as_deref(), Some("ping"));
    assert!(updated[0].last_message_at.is_some());
}

#[tokio::test]
async fn typing_snapshot_reflects_upserts() {
    let store = store().await;
    let chat = ChatId::new("room");
    let alice = user("alice");

    let mut sub = store.subscribe_typing(chat.clone());
    let initial = next_snapshot(&mut sub).await;
    assert!(initial.is_empty());

    store
        .upsert_typing(&chat, &alice, true)
        .await
        .expect("typing on");
    let typing = next_snapshot(&mut sub).await;
    assert!(typing[&alice].typing);

    store
        .upsert_typing(&chat, &alice, false)
        .await
        .expect("typing off");
    let idle = next_snapshot(&mut sub).await;
    assert!(!idle[&alice].typing);
}

#[tokio::test]
async fn user_directory_batch_and_prefix_search() {
    let store = store().await;
    for (id, email, name) in [
        ("u1", "ana@example.com", Some("Ana")),
        ("u2", "bob@example.com", Some("Bobby")),
        ("u3", "carol@example.com", None),
    ] {
        store
            .upsert_user(&User {
                id: user(id),
                email: email.to_string(),
                display_name: name.map(str::to_string),
                photo_url: None,
                is_online: false,
                last_seen: None,
                push_tokens: BTreeSet::new(),
            })
            .await
            .expect("upsert");
    }

    let batch = store
        .get_users(&[user("u1"), user("u3"), user("missing")])
        .await
        .expect("batch");
    assert_eq!(batch.len(), 2);

    let hits = store.search_users("Bo", 10).await.expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, user("u2"));

    let by_email = store.search_users("carol@", 10).await.expect("search");
    assert_eq!(by_email.len(), 1);
    assert_eq!(by_email[0].id, user("u3"));
}

#[tokio::test]
async fn push_tokens_grow_by_union() {
    let store = store().await;
    let alice = user("alice");
    store
        .upsert_user(&User {
            id: alice.clone(),
            email: "alice@example.com".into(),
            display_name: None,
            photo_url: None,
            is_online: false,
            last_seen: None,
            push_tokens: BTreeSet::new(),
        })
        .await
        .expect("upsert");

    store.add_push_token(&alice, "tok-1").await.expect("token");
    store.add_push_token(&alice, "tok-1").await.expect("token");
    store.add_push_token(&alice, "tok-2").await.expect("token");

    let tokens = store.push_tokens_for(&[alice]).await.expect("tokens");
    assert_eq!(tokens, vec!["tok-1".to_string(), "tok-2".to_string()]);
}

#[tokio::test]
async fn presence_write_updates_user_record() {
    let store = store().await;
    let alice = user("alice");
    store
        .upsert_user(&User {
            id: alice.clone(),
            email: "alice@example.com".into(),
            display_name: None,
            photo_url: None,
            is_online: false,
            last_seen: None,
            push_tokens: BTreeSet::new(),
        })
        .await
        .expect("upsert");

    let now = chrono::Utc::now();
    store
        .set_presence(&alice, true, now)
        .await
        .expect("presence");
    let fetched = store.get_users(&[alice]).await.expect("get");
    assert!(fetched[0].is_online);
    assert!(fetched[0].last_seen.is_some());
}
