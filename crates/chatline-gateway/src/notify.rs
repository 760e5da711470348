use tracing::debug;

use chatline_types::UserId;
use chatline_types::events::GatewayEvent;

use crate::registry::ChannelRegistry;

/// Pushes friend lifecycle events to online users.
///
/// Best-effort only. The friend edge is already committed by the caller, so
/// an offline target simply picks the change up on its next fetch.
#[derive(Clone)]
pub struct Notifier {
    registry: ChannelRegistry,
}

impl Notifier {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }

    pub async fn notify_friend_request(
        &self,
        to_user_id: UserId,
        from_user_id: UserId,
        from_username: &str,
    ) -> usize {
        let delivered = self
            .registry
            .publish(
                to_user_id,
                GatewayEvent::FriendRequest {
                    from_user_id,
                    from_username: from_username.to_string(),
                },
            )
            .await;
        debug!(
            "Friend request {} -> {} delivered to {} connections",
            from_user_id, to_user_id, delivered
        );
        delivered
    }

    /// Tell `to_user_id` that `by_user_id` is now their friend. Call once
    /// per party; each side hears about the other.
    pub async fn notify_friend_accepted(
        &self,
        to_user_id: UserId,
        by_user_id: UserId,
        by_username: &str,
    ) -> usize {
        self.registry
            .publish(
                to_user_id,
                GatewayEvent::FriendAccepted {
                    user_id: by_user_id,
                    username: by_username.to_string(),
                },
            )
            .await
    }
}
