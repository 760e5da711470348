pub mod api;
pub mod events;
pub mod models;

/// Stable identifier for users, groups and messages. Assigned by the store.
pub type UserId = i64;
pub type GroupId = i64;
pub type MessageId = i64;
