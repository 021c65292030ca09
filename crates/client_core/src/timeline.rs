//! Optimistic merge engine. Holds the visible ordered view of one chat by
//! merging three feeds: the realtime window, backward page loads, and
//! locally created optimistic entries awaiting settlement.

use std::collections::HashSet;

use shared::domain::{Message, MessageRef, PendingId};
use storage::PageSnapshot;

/// Shallow field merge applied to a still-pending optimistic entry, used for
/// upload progress reporting. Not a content mutation path.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub text: Option<Option<String>>,
    pub attachments: Option<Vec<shared::domain::Attachment>>,
    pub moderation: Option<Option<shared::domain::ModerationVerdict>>,
}

/// Per-chat message view. `older` holds paginated history, `window` the
/// realtime subscription's current snapshot, `pending` the optimistic
/// entries in arrival order. All confirmed segments are kept ascending by
/// creation instant.
#[derive(Debug, Default)]
pub struct Timeline {
    older: Vec<Message>,
    window: Vec<Message>,
    pending: Vec<Message>,
    has_more: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether backward pagination can fetch anything further.
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Inserts an optimistic entry. The id must be pending; confirmed
    /// messages only ever enter through the window or a settlement.
    pub fn prepend_optimistic(&mut self, message: Message) {
        debug_assert!(message.id.is_pending());
        self.pending.push(message);
    }

    /// Shallow-merges `patch` into a still-pending entry. A settled or
    /// unknown id is ignored.
    pub fn update_patch(&mut self, pending_id: &PendingId, patch: MessagePatch) {
        let target = self
            .pending
            .iter_mut()
            .find(|message| message.id == MessageRef::Pending(pending_id.clone()));
        let Some(message) = target else {
            return;
        };
        if let Some(text) = patch.text {
            message.text = text;
        }
        if let Some(attachments) = patch.attachments {
            message.attachments = attachments;
        }
        if let Some(moderation) = patch.moderation {
            message.moderation = moderation;
        }
    }

    /// Resolves an optimistic entry. `None` means the send failed and the
    /// entry is dropped. With a final message, the entry is replaced; if the
    /// final id already arrived through the realtime window, the window copy
    /// wins and, when `merge_read_by` is set, its `read_by` set is unioned
    /// with the settlement's rather than overwritten.
    pub fn settle(&mut self, pending_id: &PendingId, outcome: Option<Message>, merge_read_by: bool) {
        let pending_ref = MessageRef::Pending(pending_id.clone());
        self.pending.retain(|message| message.id != pending_ref);

        let Some(finalized) = outcome else {
            return;
        };

        if let Some(existing) = self
            .window
            .iter_mut()
            .chain(self.older.iter_mut())
            .find(|message| message.id == finalized.id)
        {
            if merge_read_by {
                let read_by = finalized.read_by;
                existing.read_by.extend(read_by);
            } else {
                *existing = finalized;
            }
            return;
        }

        let at = self
            .window
            .partition_point(|message| message.created_at <= finalized.created_at);
        self.window.insert(at, finalized);
    }

    /// Folds a realtime emission in. The window segment is replaced
    /// wholesale; optimistic entries survive untouched and confirmed
    /// duplicates in older pages are dropped in favor of the live copies.
    pub fn merge_window(&mut self, snapshot: PageSnapshot) {
        let mut window = snapshot.messages;
        window.reverse();
        let window_ids: HashSet<MessageRef> =
            window.iter().map(|message| message.id.clone()).collect();
        self.older
            .retain(|message| !window_ids.contains(&message.id));
        self.window = window;
        if self.older.is_empty() {
            self.has_more = snapshot.has_more;
        }
    }

    /// Folds one backward page in, oldest history first in the result.
    pub fn merge_older_page(&mut self, page: PageSnapshot) {
        let known: HashSet<MessageRef> = self
            .older
            .iter()
            .chain(self.window.iter())
            .map(|message| message.id.clone())
            .collect();
        let mut incoming: Vec<Message> = page
            .messages
            .into_iter()
            .filter(|message| !known.contains(&message.id))
            .collect();
        incoming.reverse();
        incoming.append(&mut self.older);
        self.older = incoming;
        self.has_more = page.has_more;
    }

    /// The visible sequence: ascending creation instant, ties kept in
    /// arrival order, pending entries after confirmed ones at equal
    /// instants.
    pub fn messages(&self) -> Vec<Message> {
        let mut visible: Vec<Message> = self
            .older
            .iter()
            .chain(self.window.iter())
            .chain(self.pending.iter())
            .cloned()
            .collect();
        visible.sort_by_key(|message| message.created_at);
        visible
    }

    /// Ids of the newest confirmed cursor for pagination, if any history is
    /// loaded.
    pub fn oldest_confirmed(&self) -> Option<&Message> {
        self.older.first().or_else(|| self.window.first())
    }

    /// Confirmed messages from other senders that `user` has not read yet.
    pub fn unread_by(&self, user: &shared::domain::UserId) -> Vec<shared::domain::MessageId> {
        self.older
            .iter()
            .chain(self.window.iter())
            .filter(|message| &message.sender_id != user && !message.read_by.contains(user))
            .filter_map(|message| match &message.id {
                MessageRef::Confirmed(id) => Some(id.clone()),
                MessageRef::Pending(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
