use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use chatline_db::NewMessage;
use chatline_types::events::GatewayEvent;
use chatline_types::models::{ChatMessage, MessageTarget};
use chatline_types::{GroupId, UserId};

use crate::error::DispatchError;
use crate::registry::ChannelRegistry;
use crate::store::MessageStore;

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

/// Outcome of a dispatched message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: ChatMessage,
    /// Recipient set resolved at dispatch time
    pub recipients: Vec<UserId>,
    /// Connections that accepted the event across all recipients
    pub delivered: usize,
}

/// Persists inbound messages and fans them out through the registry.
#[derive(Clone)]
pub struct MessageDispatcher {
    store: Arc<dyn MessageStore>,
    registry: ChannelRegistry,
}

impl MessageDispatcher {
    pub fn new(store: Arc<dyn MessageStore>, registry: ChannelRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Direct message: delivered to the receiver and echoed to every
    /// connection of the sender.
    pub async fn send_direct(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        timestamp: Option<DateTime<Utc>>,
        client_nonce: Option<Uuid>,
    ) -> Result<Delivery, DispatchError> {
        self.dispatch(sender_id, MessageTarget::Direct(receiver_id), content, timestamp, client_nonce)
            .await
    }

    /// Group message: delivered to the group's membership as of dispatch.
    pub async fn send_group(
        &self,
        sender_id: UserId,
        group_id: GroupId,
        content: String,
        timestamp: Option<DateTime<Utc>>,
        client_nonce: Option<Uuid>,
    ) -> Result<Delivery, DispatchError> {
        self.dispatch(sender_id, MessageTarget::Group(group_id), content, timestamp, client_nonce)
            .await
    }

    async fn dispatch(
        &self,
        sender_id: UserId,
        target: MessageTarget,
        content: String,
        timestamp: Option<DateTime<Utc>>,
        client_nonce: Option<Uuid>,
    ) -> Result<Delivery, DispatchError> {
        validate_content(&content)?;
        if let MessageTarget::Group(group_id) = target {
            self.check_membership(group_id, sender_id).await?;
        }

        // 1. Persist. Nothing is fanned out unless this succeeds.
        let new_message = NewMessage {
            sender_id,
            target,
            content,
            created_at: timestamp.unwrap_or_else(Utc::now),
            client_nonce,
        };
        let to_store = new_message.clone();
        let id = self
            .blocking(move |store| store.store_message(&to_store))
            .await?
            .map_err(|e| {
                error!("Failed to persist message from user {}: {:#}", sender_id, e);
                DispatchError::Persistence(e)
            })?;

        // 2. Sender's display name for the echo
        let sender_username = match self.blocking(move |store| store.username(sender_id)).await? {
            Ok(Some(name)) => name,
            Ok(None) => {
                warn!("Message {} sender {} has no username", id, sender_id);
                "unknown".to_string()
            }
            Err(e) => {
                warn!("Username lookup for {} failed: {:#}", sender_id, e);
                "unknown".to_string()
            }
        };

        let message = ChatMessage::new(
            id,
            sender_id,
            target,
            new_message.content,
            new_message.created_at,
            sender_username,
        )
        .with_nonce(client_nonce);

        // 3. Recipient snapshot
        let (recipients, membership_error) = match target {
            MessageTarget::Direct(receiver_id) => {
                let mut set = vec![sender_id];
                if receiver_id != sender_id {
                    set.push(receiver_id);
                }
                (set, None)
            }
            MessageTarget::Group(group_id) => self.resolve_members(group_id).await?,
        };

        // 4. Fan out
        let event = match target {
            MessageTarget::Direct(_) => GatewayEvent::DirectMessage(message.clone()),
            MessageTarget::Group(_) => GatewayEvent::GroupMessage(message.clone()),
        };
        let mut delivered = 0;
        for uid in &recipients {
            delivered += self.registry.publish(*uid, event.clone()).await;
        }

        debug!(
            "Message {} from user {} fanned out to {} users ({} connections)",
            id,
            sender_id,
            recipients.len(),
            delivered
        );

        match membership_error {
            Some(err) => Err(err),
            None => Ok(Delivery {
                message,
                recipients,
                delivered,
            }),
        }
    }

    /// Only members may post. Runs before anything is persisted.
    async fn check_membership(&self, group_id: GroupId, sender_id: UserId) -> Result<(), DispatchError> {
        match self.blocking(move |store| store.is_member(group_id, sender_id)).await? {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("User {} is not a member of group {}", sender_id, group_id);
                Err(DispatchError::NotAMember { group_id })
            }
            Err(e) => {
                warn!("Membership check for group {} failed: {:#}", group_id, e);
                Err(DispatchError::MembershipUnavailable { group_id })
            }
        }
    }

    /// A missing group or failed lookup yields an empty recipient set plus
    /// the error to report back to the sender.
    async fn resolve_members(
        &self,
        group_id: GroupId,
    ) -> Result<(Vec<UserId>, Option<DispatchError>), DispatchError> {
        match self.blocking(move |store| store.group_members(group_id)).await? {
            Ok(Some(members)) => Ok((members, None)),
            Ok(None) => {
                warn!("Group {} vanished before fan-out", group_id);
                Ok((Vec::new(), Some(DispatchError::MembershipUnavailable { group_id })))
            }
            Err(e) => {
                warn!("Member lookup for group {} failed: {:#}", group_id, e);
                Ok((Vec::new(), Some(DispatchError::MembershipUnavailable { group_id })))
            }
        }
    }

    /// Run a blocking store call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<anyhow::Result<T>, DispatchError>
    where
        F: FnOnce(&dyn MessageStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                DispatchError::Internal(e.to_string())
            })
    }
}

fn validate_content(content: &str) -> Result<(), DispatchError> {
    if content.trim().is_empty() {
        return Err(DispatchError::EmptyContent);
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(DispatchError::ContentTooLong {
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(())
}
