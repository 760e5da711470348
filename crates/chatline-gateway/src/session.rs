use tracing::{debug, info};

use chatline_types::UserId;
use chatline_types::events::GatewayEvent;

use crate::error::SessionError;
use crate::registry::{ChannelRegistry, ConnectionHandle, Registration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, no channel bound yet
    Connecting,
    Joined(UserId),
    /// Terminal for this connection instance
    Disconnected,
}

/// Lifecycle of one connection instance: `Connecting -> Joined -> Disconnected`.
///
/// A reconnecting client gets a brand new `Session` and must join again.
pub struct Session {
    registry: ChannelRegistry,
    handle: ConnectionHandle,
    /// Identity established at the transport boundary (the upgrade token).
    authenticated: UserId,
    state: SessionState,
}

impl Session {
    pub fn new(registry: ChannelRegistry, handle: ConnectionHandle, authenticated: UserId) -> Self {
        Self {
            registry,
            handle,
            authenticated,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Bind this connection to `user_id`'s channel and acknowledge.
    /// Joining again as the same user re-acknowledges without duplicating
    /// the registration.
    pub async fn join(&mut self, user_id: UserId) -> Result<(), SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::Closed);
        }
        if user_id != self.authenticated {
            return Err(SessionError::IdentityMismatch {
                requested: user_id,
                authenticated: self.authenticated,
            });
        }

        match self.registry.register(user_id, &self.handle).await {
            Registration::Added => {
                info!("User {} joined on connection {}", user_id, self.handle.id());
            }
            Registration::Unchanged => {
                debug!("User {} re-joined on connection {}", user_id, self.handle.id());
            }
            Registration::Refused => return Err(SessionError::Closed),
        }
        self.state = SessionState::Joined(user_id);

        self.handle.send(GatewayEvent::Connected {
            user_id,
            message: "Successfully connected to server".to_string(),
        });
        Ok(())
    }

    /// Check that a message claiming to come from `sender_id` may be sent
    /// on this connection.
    pub fn authorize_sender(&self, sender_id: UserId) -> Result<UserId, SessionError> {
        match self.state {
            SessionState::Joined(uid) if uid == sender_id => Ok(uid),
            SessionState::Joined(uid) => Err(SessionError::IdentityMismatch {
                requested: sender_id,
                authenticated: uid,
            }),
            SessionState::Connecting => Err(SessionError::NotJoined),
            SessionState::Disconnected => Err(SessionError::Closed),
        }
    }

    /// Tear down from any state. Safe to call more than once.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if let Some(uid) = self.registry.unregister(&self.handle).await {
            debug!("Connection {} for user {} unregistered", self.handle.id(), uid);
        }
        self.state = SessionState::Disconnected;
    }
}
