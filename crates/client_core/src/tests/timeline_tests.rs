use super::*;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, TimeZone, Utc};

use shared::domain::{ChatId, Message, MessageId, MessageKind, UserId};

fn at(offset_secs: i64) -> chrono::DateTime<chrono::Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs)
}

fn confirmed(id: &str, offset_secs: i64) -> Message {
    Message {
        chat_id: ChatId::new("room"),
        id: MessageRef::Confirmed(MessageId::new(id)),
        sender_id: UserId::new("alice"),
        text: Some(id.to_string()),
        attachments: Vec::new(),
        kind: MessageKind::Text,
        created_at: at(offset_secs),
        edited_at: None,
        deleted_at: None,
        reactions: BTreeMap::new(),
        read_by: BTreeSet::new(),
        moderation: None,
    }
}

fn optimistic(offset_secs: i64) -> (PendingId, Message) {
    let pending = PendingId::generate();
    let message = Message {
        id: MessageRef::Pending(pending.clone()),
        text: Some("draft".to_string()),
        created_at: at(offset_secs),
        ..confirmed("ignored", offset_secs)
    };
    (pending, message)
}

fn window(messages_desc: Vec<Message>, has_more: bool) -> PageSnapshot {
    PageSnapshot {
        messages: messages_desc,
        has_more,
    }
}

fn visible_ids(timeline: &Timeline) -> Vec<String> {
    timeline
        .messages()
        .into_iter()
        .map(|message| String::from(message.id))
        .collect()
}

#[test]
fn settle_replaces_the_optimistic_entry_exactly_once() {
    let mut timeline = Timeline::new();
    let (pending, message) = optimistic(10);
    timeline.prepend_optimistic(message);
    assert!(timeline.messages()[0].id.is_pending());

    timeline.settle(&pending, Some(confirmed("m-1", 10)), false);
    let visible = timeline.messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, MessageRef::Confirmed(MessageId::new("m-1")));
}

#[test]
fn settle_with_none_drops_the_entry() {
    let mut timeline = Timeline::new();
    let (pending, message) = optimistic(10);
    timeline.prepend_optimistic(message);

    timeline.settle(&pending, None, false);
    assert!(timeline.messages().is_empty());

    // Settling an already-settled id is a no-op.
    timeline.settle(&pending, None, false);
    assert!(timeline.messages().is_empty());
}

#[test]
fn settle_unions_read_by_when_the_window_delivered_first() {
    let mut timeline = Timeline::new();
    let (pending, message) = optimistic(10);
    timeline.prepend_optimistic(message);

    // Realtime delivery of the canonical record wins the race.
    let mut live = confirmed("m-1", 10);
    live.read_by = BTreeSet::from([UserId::new("bob")]);
    timeline.merge_window(window(vec![live], false));

    let mut readback = confirmed("m-1", 10);
    readback.read_by = BTreeSet::from([UserId::new("alice")]);
    timeline.settle(&pending, Some(readback), true);

    let visible = timeline.messages();
    assert_eq!(visible.len(), 1);
    assert_eq!(
        visible[0].read_by,
        BTreeSet::from([UserId::new("alice"), UserId::new("bob")])
    );
}

#[test]
fn merge_window_replaces_live_entries_but_keeps_pending() {
    let mut timeline = Timeline::new();
    timeline.merge_window(window(vec![confirmed("m-2", 20), confirmed("m-1", 10)], false));
    let (_, message) = optimistic(30);
    timeline.prepend_optimistic(message);

    timeline.merge_window(window(vec![confirmed("m-3", 25), confirmed("m-2", 20)], true));
    let ids = visible_ids(&timeline);
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], "m-2");
    assert_eq!(ids[1], "m-3");
    assert!(ids[2].starts_with(shared::domain::PENDING_ID_PREFIX));
    assert!(timeline.has_more());
}

#[test]
fn older_pages_merge_without_duplicates() {
    let mut timeline = Timeline::new();
    timeline.merge_window(window(vec![confirmed("m-4", 40), confirmed("m-3", 30)], true));

    timeline.merge_older_page(window(vec![confirmed("m-2", 20), confirmed("m-1", 10)], false));
    assert_eq!(visible_ids(&timeline), vec!["m-1", "m-2", "m-3", "m-4"]);
    assert!(!timeline.has_more());

    // A re-delivered window overlapping the paged history stays deduplicated.
    timeline.merge_window(window(
        vec![confirmed("m-4", 40), confirmed("m-3", 30), confirmed("m-2", 20)],
        true,
    ));
    assert_eq!(visible_ids(&timeline), vec!["m-1", "m-2", "m-3", "m-4"]);
}

#[test]
fn equal_instants_keep_arrival_order() {
    let mut timeline = Timeline::new();
    timeline.merge_window(window(vec![confirmed("b", 10), confirmed("a", 10)], false));
    // The window arrives newest-first; arrival order within a tie is the
    // stored order, oldest segment first.
    assert_eq!(visible_ids(&timeline), vec!["a", "b"]);
}

#[test]
fn update_patch_touches_only_pending_entries() {
    let mut timeline = Timeline::new();
    let (pending, message) = optimistic(10);
    timeline.prepend_optimistic(message);

    timeline.update_patch(
        &pending,
        MessagePatch {
            text: Some(Some("uploading 50%".to_string())),
            ..MessagePatch::default()
        },
    );
    assert_eq!(timeline.messages()[0].text.as_deref(), Some("uploading 50%"));

    timeline.settle(&pending, Some(confirmed("m-1", 10)), false);
    timeline.update_patch(
        &pending,
        MessagePatch {
            text: Some(Some("too late".to_string())),
            ..MessagePatch::default()
        },
    );
    assert_eq!(timeline.messages()[0].text.as_deref(), Some("m-1"));
}

#[test]
fn unread_by_skips_own_and_already_read_messages() {
    let bob = UserId::new("bob");
    let mut timeline = Timeline::new();

    let mut seen = confirmed("m-1", 10);
    seen.read_by = BTreeSet::from([bob.clone()]);
    let mut own = confirmed("m-2", 20);
    own.sender_id = bob.clone();
    let fresh = confirmed("m-3", 30);
    timeline.merge_window(window(vec![fresh, own, seen], false));

    assert_eq!(timeline.unread_by(&bob), vec![MessageId::new("m-3")]);
}
