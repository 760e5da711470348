use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use chatline_types::models::{ChatMessage, MessageTarget};
use chatline_types::{GroupId, MessageId, UserId};

/// The conversation a view renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversation {
    Direct { me: UserId, peer: UserId },
    Group(GroupId),
}

impl Conversation {
    pub fn contains(&self, message: &ChatMessage) -> bool {
        match (*self, message.target()) {
            (Conversation::Direct { me, peer }, Some(MessageTarget::Direct(receiver))) => {
                (message.sender_id == me && receiver == peer)
                    || (message.sender_id == peer && receiver == me)
            }
            (Conversation::Group(gid), Some(MessageTarget::Group(target))) => gid == target,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    /// `None` until the server echo confirms the optimistic entry
    pub id: Option<MessageId>,
    pub client_nonce: Option<Uuid>,
    pub sender_id: UserId,
    pub sender_username: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ViewEntry {
    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }

    fn from_message(message: ChatMessage) -> Self {
        Self {
            id: Some(message.id),
            client_nonce: message.client_nonce,
            sender_id: message.sender_id,
            sender_username: message.sender_username,
            content: message.content,
            timestamp: message.timestamp,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id.unwrap_or(MessageId::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Matched a pending entry by nonce and filled in its id
    Confirmed,
    Duplicate,
    /// Belongs to another conversation
    Ignored,
}

/// Ordered message history for one conversation.
///
/// Live events and history fetches both feed `merge`, which is idempotent
/// on the persisted id. Optimistic entries are matched to their echo by
/// client nonce.
#[derive(Debug)]
pub struct MessageView {
    conversation: Conversation,
    entries: Vec<ViewEntry>,
    seen: HashSet<MessageId>,
}

impl MessageView {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            conversation,
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn conversation(&self) -> Conversation {
        self.conversation
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an unconfirmed local entry and return the nonce to send with it.
    pub fn push_pending(
        &mut self,
        sender_id: UserId,
        sender_username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Uuid {
        let nonce = Uuid::new_v4();
        self.insert_sorted(ViewEntry {
            id: None,
            client_nonce: Some(nonce),
            sender_id,
            sender_username: sender_username.into(),
            content: content.into(),
            timestamp,
        });
        nonce
    }

    pub fn merge(&mut self, message: ChatMessage) -> MergeOutcome {
        if !self.conversation.contains(&message) {
            return MergeOutcome::Ignored;
        }
        if self.seen.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }
        self.seen.insert(message.id);

        if let Some(nonce) = message.client_nonce {
            let pending = self
                .entries
                .iter()
                .position(|e| e.is_pending() && e.client_nonce == Some(nonce));
            if let Some(idx) = pending {
                self.entries.remove(idx);
                self.insert_sorted(ViewEntry::from_message(message));
                return MergeOutcome::Confirmed;
            }
        }

        self.insert_sorted(ViewEntry::from_message(message));
        MergeOutcome::Inserted
    }

    /// Merge a history page. Returns how many entries were new or confirmed.
    pub fn merge_history(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> usize {
        messages
            .into_iter()
            .map(|m| self.merge(m))
            .filter(|o| matches!(o, MergeOutcome::Inserted | MergeOutcome::Confirmed))
            .count()
    }

    /// Drop a pending entry whose send failed.
    pub fn discard_pending(&mut self, nonce: Uuid) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.is_pending() && e.client_nonce == Some(nonce)));
        self.entries.len() != before
    }

    fn insert_sorted(&mut self, entry: ViewEntry) {
        let key = entry.sort_key();
        let idx = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(idx, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ALICE: UserId = 1;
    const BOB: UserId = 2;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn direct(id: MessageId, from: UserId, to: UserId, content: &str, ms: i64) -> ChatMessage {
        ChatMessage::new(
            id,
            from,
            MessageTarget::Direct(to),
            content.into(),
            at(ms),
            if from == ALICE { "alice" } else { "bob" }.into(),
        )
    }

    fn contents(view: &MessageView) -> Vec<&str> {
        view.entries().iter().map(|e| e.content.as_str()).collect()
    }

    #[test]
    fn same_message_twice_is_shown_once() {
        let mut view = MessageView::new(Conversation::Direct { me: ALICE, peer: BOB });
        let msg = direct(10, BOB, ALICE, "hi", 1000);

        assert_eq!(view.merge(msg.clone()), MergeOutcome::Inserted);
        assert_eq!(view.merge(msg), MergeOutcome::Duplicate);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn identical_content_with_distinct_ids_is_kept() {
        let mut view = MessageView::new(Conversation::Direct { me: ALICE, peer: BOB });
        view.merge(direct(10, BOB, ALICE, "ok", 1000));
        view.merge(direct(11, BOB, ALICE, "ok", 1000));
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn history_overlapping_live_delivery() {
        let mut view = MessageView::new(Conversation::Direct { me: ALICE, peer: BOB });
        view.merge(direct(3, BOB, ALICE, "live", 3000));

        let history = vec![
            direct(1, ALICE, BOB, "one", 1000),
            direct(2, BOB, ALICE, "two", 2000),
            direct(3, BOB, ALICE, "live", 3000),
        ];
        assert_eq!(view.merge_history(history), 2);
        assert_eq!(contents(&view), ["one", "two", "live"]);
    }

    #[test]
    fn echo_confirms_pending_entry() {
        let mut view = MessageView::new(Conversation::Direct { me: ALICE, peer: BOB });
        let nonce = view.push_pending(ALICE, "alice", "sent", at(5000));
        assert!(view.entries()[0].is_pending());

        let echo = direct(42, ALICE, BOB, "sent", 5000).with_nonce(Some(nonce));
        assert_eq!(view.merge(echo.clone()), MergeOutcome::Confirmed);
        assert_eq!(view.len(), 1);
        assert_eq!(view.entries()[0].id, Some(42));

        // Second device's copy of the same echo
        assert_eq!(view.merge(echo), MergeOutcome::Duplicate);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn other_conversations_are_ignored() {
        let mut view = MessageView::new(Conversation::Direct { me: ALICE, peer: BOB });
        assert_eq!(view.merge(direct(1, 3, ALICE, "hey", 0)), MergeOutcome::Ignored);

        let group = ChatMessage::new(2, BOB, MessageTarget::Group(9), "g".into(), at(0), "bob".into());
        assert_eq!(view.merge(group.clone()), MergeOutcome::Ignored);

        let mut group_view = MessageView::new(Conversation::Group(9));
        assert_eq!(group_view.merge(group), MergeOutcome::Inserted);
    }

    #[test]
    fn out_of_order_arrival_is_sorted() {
        let mut view = MessageView::new(Conversation::Group(9));
        let msg = |id, ms| ChatMessage::new(id, BOB, MessageTarget::Group(9), format!("m{id}"), at(ms), "bob".into());
        view.merge(msg(3, 3000));
        view.merge(msg(1, 1000));
        view.merge(msg(2, 1000));
        assert_eq!(contents(&view), ["m1", "m2", "m3"]);
    }

    #[test]
    fn failed_send_can_be_discarded() {
        let mut view = MessageView::new(Conversation::Group(9));
        let nonce = view.push_pending(ALICE, "alice", "lost", at(0));
        assert!(view.discard_pending(nonce));
        assert!(view.is_empty());
    }
}
