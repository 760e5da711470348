use thiserror::Error;

use chatline_types::{GroupId, UserId};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {max} characters")]
    ContentTooLong { max: usize },
    #[error("failed to store message: {0}")]
    Persistence(#[source] anyhow::Error),
    #[error("not a member of group {group_id}")]
    NotAMember { group_id: GroupId },
    #[error("could not resolve members of group {group_id}")]
    MembershipUnavailable { group_id: GroupId },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Text for the client-facing `Error` event. Storage details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Persistence(_) | Self::Internal(_) => "Failed to send message".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("join before sending messages")]
    NotJoined,
    #[error("connection is closed")]
    Closed,
    #[error("cannot act as user {requested}, connection belongs to user {authenticated}")]
    IdentityMismatch {
        requested: UserId,
        authenticated: UserId,
    },
}
