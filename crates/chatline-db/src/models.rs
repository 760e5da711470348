//! Database row types. These map directly to SQLite rows.
//! Distinct from chatline-types API models to keep the DB layer independent.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::warn;
use uuid::Uuid;

use chatline_types::models::{ChatMessage, MessageTarget};
use chatline_types::{GroupId, MessageId, UserId};

pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct PendingRequestRow {
    pub user_id: UserId,
    pub username: String,
    pub created_at: String,
}

pub struct GroupRow {
    pub id: GroupId,
    pub name: String,
    pub code: String,
    pub created_by: UserId,
    pub creator_username: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub content: String,
    pub client_nonce: Option<String>,
    pub created_at: String,
    pub sender_username: String,
}

impl MessageRow {
    /// Returns `None` for a row whose addressing is corrupt.
    pub fn into_message(self) -> Option<ChatMessage> {
        let target = match (self.receiver_id, self.group_id) {
            (Some(uid), None) => MessageTarget::Direct(uid),
            (None, Some(gid)) => MessageTarget::Group(gid),
            _ => {
                warn!("Message {} has malformed addressing, skipping", self.id);
                return None;
            }
        };

        let nonce = self.client_nonce.as_deref().and_then(|n| match n.parse::<Uuid>() {
            Ok(u) => Some(u),
            Err(e) => {
                warn!("Corrupt client_nonce '{}' on message {}: {}", n, self.id, e);
                None
            }
        });

        let timestamp = parse_timestamp(&self.created_at).unwrap_or_else(|| {
            warn!("Corrupt created_at '{}' on message {}", self.created_at, self.id);
            DateTime::default()
        });

        Some(
            ChatMessage::new(self.id, self.sender_id, target, self.content, timestamp, self.sender_username)
                .with_nonce(nonce),
        )
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone suffix
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .ok()
}
