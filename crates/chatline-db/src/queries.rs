use crate::Database;
use crate::models::{GroupRow, MessageRow, PendingRequestRow, UserRow, format_timestamp};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use uuid::Uuid;

use chatline_types::models::{ChatMessage, FriendEdge, FriendStatus, MessageTarget, User};
use chatline_types::{GroupId, MessageId, UserId};

/// Result of trying to open a friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendRequestOutcome {
    Created,
    AlreadyFriends,
    AlreadyPending,
    SelfRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupJoinOutcome {
    Joined(GroupId),
    AlreadyMember(GroupId),
    UnknownCode,
}

/// A message about to be persisted. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub target: MessageTarget,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub client_nonce: Option<Uuid>,
}

impl Database {
    // -- Users --

    /// Returns `None` if the username is taken.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<Option<UserId>> {
        self.with_conn(|conn| {
            match conn.execute(
                "INSERT INTO users (username, password) VALUES (?1, ?2)",
                (username, password_hash),
            ) {
                Ok(_) => Ok(Some(conn.last_insert_rowid())),
                Err(e) if is_constraint_violation(&e) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, password, created_at FROM users WHERE username = ?1",
                [username],
                user_from_row,
            )
            .optional()
        })
    }

    pub fn get_user_by_id(&self, id: UserId) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, password, created_at FROM users WHERE id = ?1",
                [id],
                user_from_row,
            )
            .optional()
        })
    }

    pub fn get_username(&self, id: UserId) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| row.get(0))
                .optional()
        })
    }

    // -- Friends --

    pub fn send_friend_request(&self, from: UserId, to: UserId) -> Result<FriendRequestOutcome> {
        if from == to {
            return Ok(FriendRequestOutcome::SelfRequest);
        }

        self.with_conn(|conn| {
            if let Some(edge) = query_friend_edge(conn, from, to)? {
                return Ok(match edge.status {
                    FriendStatus::Accepted => FriendRequestOutcome::AlreadyFriends,
                    FriendStatus::Pending => FriendRequestOutcome::AlreadyPending,
                });
            }

            match conn.execute(
                "INSERT INTO friends (user_id, friend_id, status) VALUES (?1, ?2, 'pending')",
                (from, to),
            ) {
                Ok(_) => Ok(FriendRequestOutcome::Created),
                // Lost a race with the reverse request
                Err(e) if is_constraint_violation(&e) => Ok(FriendRequestOutcome::AlreadyPending),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Moves a pending request from `requester` to `accepter` to accepted.
    /// Returns false if there was no such pending request.
    pub fn accept_friend_request(&self, requester: UserId, accepter: UserId) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE friends SET status = 'accepted'
                 WHERE user_id = ?1 AND friend_id = ?2 AND status = 'pending'",
                (requester, accepter),
            )?;
            Ok(changed == 1)
        })
    }

    /// The edge between two users, in either direction.
    pub fn get_friend_edge(&self, a: UserId, b: UserId) -> Result<Option<FriendEdge>> {
        self.with_conn(|conn| query_friend_edge(conn, a, b))
    }

    pub fn list_friends(&self, user_id: UserId) -> Result<Vec<User>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username
                 FROM users u
                 JOIN friends f ON (f.friend_id = u.id AND f.user_id = ?1)
                                OR (f.user_id = u.id AND f.friend_id = ?1)
                 WHERE f.status = 'accepted'
                 ORDER BY u.username",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Incoming pending requests for `user_id`, newest first.
    pub fn list_pending_requests(&self, user_id: UserId) -> Result<Vec<PendingRequestRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, f.created_at
                 FROM users u
                 JOIN friends f ON f.user_id = u.id
                 WHERE f.friend_id = ?1 AND f.status = 'pending'
                 ORDER BY f.created_at DESC, f.id DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(PendingRequestRow {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Groups --

    /// Creates the group and adds the creator as its first member.
    /// Returns `None` if the join code is already in use.
    pub fn create_group(&self, name: &str, code: &str, creator: UserId) -> Result<Option<GroupId>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            match tx.execute(
                "INSERT INTO chat_groups (name, code, created_by) VALUES (?1, ?2, ?3)",
                (name, code, creator),
            ) {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            let group_id = tx.last_insert_rowid();

            tx.execute(
                "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                (group_id, creator),
            )?;
            tx.commit()?;

            Ok(Some(group_id))
        })
    }

    pub fn get_group(&self, group_id: GroupId) -> Result<Option<GroupRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT g.id, g.name, g.code, g.created_by, u.username, g.created_at
                 FROM chat_groups g
                 JOIN users u ON g.created_by = u.id
                 WHERE g.id = ?1",
                [group_id],
                group_from_row,
            )
            .optional()
        })
    }

    /// Groups `user_id` belongs to, newest first.
    pub fn list_user_groups(&self, user_id: UserId) -> Result<Vec<GroupRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.code, g.created_by, u.username, g.created_at
                 FROM chat_groups g
                 JOIN users u ON g.created_by = u.id
                 JOIN group_members gm ON g.id = gm.group_id
                 WHERE gm.user_id = ?1
                 ORDER BY g.created_at DESC, g.id DESC",
            )?;

            let rows = stmt
                .query_map([user_id], group_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn join_group_by_code(&self, code: &str, user_id: UserId) -> Result<GroupJoinOutcome> {
        self.with_conn(|conn| {
            let group_id: Option<GroupId> = conn
                .query_row("SELECT id FROM chat_groups WHERE code = ?1", [code], |row| row.get(0))
                .optional()?;

            let Some(group_id) = group_id else {
                return Ok(GroupJoinOutcome::UnknownCode);
            };

            match conn.execute(
                "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                (group_id, user_id),
            ) {
                Ok(_) => Ok(GroupJoinOutcome::Joined(group_id)),
                Err(e) if is_constraint_violation(&e) => Ok(GroupJoinOutcome::AlreadyMember(group_id)),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Current members of a group, or `None` if the group does not exist.
    pub fn get_group_members(&self, group_id: GroupId) -> Result<Option<Vec<UserId>>> {
        self.with_conn(|conn| {
            let exists: Option<GroupId> = conn
                .query_row("SELECT id FROM chat_groups WHERE id = ?1", [group_id], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Ok(None);
            }

            let mut stmt =
                conn.prepare("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id")?;
            let members = stmt
                .query_map([group_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<UserId>, _>>()?;

            Ok(Some(members))
        })
    }

    pub fn is_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    (group_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Messages --

    pub fn insert_message(&self, msg: &NewMessage) -> Result<MessageId> {
        let (receiver_id, group_id) = match msg.target {
            MessageTarget::Direct(uid) => (Some(uid), None),
            MessageTarget::Group(gid) => (None, Some(gid)),
        };
        let nonce = msg.client_nonce.map(|n| n.to_string());
        let created_at = format_timestamp(&msg.created_at);

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, group_id, content, client_nonce, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![msg.sender_id, receiver_id, group_id, msg.content, nonce, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Direct messages exchanged between two users, oldest first.
    pub fn get_direct_messages(&self, a: UserId, b: UserId) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| {
            query_messages(
                conn,
                "WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
                    OR (m.sender_id = ?2 AND m.receiver_id = ?1)",
                &[&a, &b],
            )
        })
    }

    /// Messages posted to a group, oldest first.
    pub fn get_group_messages(&self, group_id: GroupId) -> Result<Vec<ChatMessage>> {
        self.with_conn(|conn| query_messages(conn, "WHERE m.group_id = ?1", &[&group_id]))
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        created_by: row.get(3)?,
        creator_username: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn query_friend_edge(conn: &Connection, a: UserId, b: UserId) -> Result<Option<FriendEdge>> {
    let row: Option<(UserId, UserId, String)> = conn
        .query_row(
            "SELECT user_id, friend_id, status FROM friends
             WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
            (a, b),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(user_id, friend_id, status)| -> Result<FriendEdge> {
        let status = FriendStatus::parse(&status)
            .ok_or_else(|| anyhow::anyhow!("Unknown friend status '{}'", status))?;
        Ok(FriendEdge {
            user_id,
            friend_id,
            status,
        })
    })
    .transpose()
}

fn query_messages(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<ChatMessage>> {
    // JOIN users to fetch sender_username in a single query
    let sql = format!(
        "SELECT m.id, m.sender_id, m.receiver_id, m.group_id, m.content, m.client_nonce,
                m.created_at, u.username
         FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         {}
         ORDER BY m.created_at ASC, m.id ASC",
        filter
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                receiver_id: row.get(2)?,
                group_id: row.get(3)?,
                content: row.get(4)?,
                client_nonce: row.get(5)?,
                created_at: row.get(6)?,
                sender_username: row
                    .get::<_, Option<String>>(7)?
                    .unwrap_or_else(|| "unknown".to_string()),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().filter_map(MessageRow::into_message).collect())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
