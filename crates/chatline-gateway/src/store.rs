use anyhow::Result;

use chatline_db::{Database, NewMessage};
use chatline_types::models::ChatMessage;
use chatline_types::{GroupId, MessageId, UserId};

/// What the realtime core needs from durable storage.
///
/// Calls are blocking; async callers go through `spawn_blocking`.
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message and return its store-assigned id.
    fn store_message(&self, msg: &NewMessage) -> Result<MessageId>;

    fn username(&self, user_id: UserId) -> Result<Option<String>>;

    /// Current member ids, or `None` if the group does not exist.
    fn group_members(&self, group_id: GroupId) -> Result<Option<Vec<UserId>>>;

    /// False for a missing group as well as for a non-member.
    fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool>;

    fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>>;

    fn group_history(&self, group_id: GroupId) -> Result<Vec<ChatMessage>>;
}

impl MessageStore for Database {
    fn store_message(&self, msg: &NewMessage) -> Result<MessageId> {
        self.insert_message(msg)
    }

    fn username(&self, user_id: UserId) -> Result<Option<String>> {
        self.get_username(user_id)
    }

    fn group_members(&self, group_id: GroupId) -> Result<Option<Vec<UserId>>> {
        self.get_group_members(group_id)
    }

    fn is_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        self.is_group_member(group_id, user_id)
    }

    fn direct_history(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>> {
        self.get_direct_messages(a, b)
    }

    fn group_history(&self, group_id: GroupId) -> Result<Vec<ChatMessage>> {
        self.get_group_messages(group_id)
    }
}
