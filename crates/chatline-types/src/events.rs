use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ChatMessage;
use crate::{GroupId, UserId};

/// Events sent over the WebSocket gateway, server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Sent once per successful join
    Connected { user_id: UserId, message: String },

    /// A direct message, fanned out to both sender and receiver
    DirectMessage(ChatMessage),

    /// A group message, fanned out to every member at dispatch time
    GroupMessage(ChatMessage),

    /// Someone sent this user a friend request
    FriendRequest {
        from_user_id: UserId,
        from_username: String,
    },

    /// A friend request involving this user was accepted.
    /// `user_id`/`username` always name the other party.
    FriendAccepted { user_id: UserId, username: String },

    /// Processing failure, delivered to the originating connection only
    Error { message: String },
}

impl GatewayEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "Connected",
            Self::DirectMessage(_) => "DirectMessage",
            Self::GroupMessage(_) => "GroupMessage",
            Self::FriendRequest { .. } => "FriendRequest",
            Self::FriendAccepted { .. } => "FriendAccepted",
            Self::Error { .. } => "Error",
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Bind this connection to a user's channel
    Join { user_id: UserId },

    DirectMessage {
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        client_nonce: Option<Uuid>,
    },

    GroupMessage {
        sender_id: UserId,
        group_id: GroupId,
        content: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        client_nonce: Option<Uuid>,
    },
}
