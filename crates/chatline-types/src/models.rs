use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{GroupId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    Pending,
    Accepted,
}

impl FriendStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            _ => None,
        }
    }
}

/// A friendship between two users. `user_id` is the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendEdge {
    pub user_id: UserId,
    pub friend_id: UserId,
    pub status: FriendStatus,
}

/// Where a message is addressed. A message always has exactly one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTarget {
    Direct(UserId),
    Group(GroupId),
}

/// A persisted chat message as delivered to clients and returned from history.
///
/// `receiver_id` and `group_id` are mutually exclusive on the wire; use
/// [`ChatMessage::target`] rather than reading them directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub sender_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_nonce: Option<Uuid>,
}

impl ChatMessage {
    pub fn new(
        id: MessageId,
        sender_id: UserId,
        target: MessageTarget,
        content: String,
        timestamp: DateTime<Utc>,
        sender_username: String,
    ) -> Self {
        let (receiver_id, group_id) = match target {
            MessageTarget::Direct(uid) => (Some(uid), None),
            MessageTarget::Group(gid) => (None, Some(gid)),
        };
        Self {
            id,
            sender_id,
            receiver_id,
            group_id,
            content,
            timestamp,
            sender_username,
            client_nonce: None,
        }
    }

    pub fn with_nonce(mut self, nonce: Option<Uuid>) -> Self {
        self.client_nonce = nonce;
        self
    }

    /// Returns `None` when the addressing is malformed (neither or both set).
    pub fn target(&self) -> Option<MessageTarget> {
        match (self.receiver_id, self.group_id) {
            (Some(uid), None) => Some(MessageTarget::Direct(uid)),
            (None, Some(gid)) => Some(MessageTarget::Group(gid)),
            _ => None,
        }
    }
}
