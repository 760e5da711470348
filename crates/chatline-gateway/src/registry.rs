use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use chatline_types::UserId;
use chatline_types::events::GatewayEvent;

/// Send side of one live transport session.
///
/// Cloning yields another handle to the same connection; identity is the
/// `id`, not the channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ConnectionHandle {
    /// Create a handle plus the receiver the connection's writer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: Uuid::new_v4(), tx }, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue an event for this connection. Returns false if it has gone away.
    pub fn send(&self, event: GatewayEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Result of [`ChannelRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Already registered under this user
    Unchanged,
    /// The registry has been shut down
    Refused,
}

/// Maps a user id to every live connection for that user.
///
/// Process-local and rebuilt from nothing on restart: reconnecting clients
/// re-join. A user with no connections has no entry at all.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<RegistryState>>,
    /// Flips to true once on shutdown; connection writers watch it
    closing: Arc<watch::Sender<bool>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::default(),
            closing: Arc::new(closing),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// user_id -> (conn_id -> handle)
    channels: HashMap<UserId, HashMap<Uuid, ConnectionHandle>>,

    /// conn_id -> owning user_id
    owners: HashMap<Uuid, UserId>,

    shut_down: bool,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to the set for `user_id`. Idempotent; a handle registered
    /// under a different user is moved.
    pub async fn register(&self, user_id: UserId, handle: &ConnectionHandle) -> Registration {
        let mut state = self.inner.write().await;
        if state.shut_down {
            warn!("Registry is shut down, refusing connection {} for user {}", handle.id, user_id);
            return Registration::Refused;
        }

        match state.owners.get(&handle.id).copied() {
            Some(owner) if owner == user_id => return Registration::Unchanged,
            Some(owner) => {
                debug!("Moving connection {} from user {} to user {}", handle.id, owner, user_id);
                state.remove_conn(owner, handle.id);
            }
            None => {}
        }

        state.owners.insert(handle.id, user_id);
        state
            .channels
            .entry(user_id)
            .or_default()
            .insert(handle.id, handle.clone());

        trace!(
            "Registered connection {} for user {} ({} live)",
            handle.id,
            user_id,
            state.channels.get(&user_id).map_or(0, HashMap::len)
        );
        Registration::Added
    }

    /// Remove `handle` from whichever user set holds it. No-op if absent.
    /// Returns the user it was registered under.
    pub async fn unregister(&self, handle: &ConnectionHandle) -> Option<UserId> {
        let mut state = self.inner.write().await;
        let owner = state.owners.remove(&handle.id)?;
        state.remove_conn(owner, handle.id);
        Some(owner)
    }

    /// Deliver `event` to every connection registered for `user_id`.
    ///
    /// Fire-and-forget per connection: a closed connection is skipped and
    /// does not stop delivery to the rest. With no connections the event is
    /// dropped. Returns how many connections accepted it.
    pub async fn publish(&self, user_id: UserId, event: GatewayEvent) -> usize {
        let state = self.inner.read().await;
        let Some(conns) = state.channels.get(&user_id) else {
            trace!("User {} offline, dropping {}", user_id, event.kind());
            return 0;
        };

        let mut delivered = 0;
        for handle in conns.values() {
            if handle.send(event.clone()) {
                delivered += 1;
            } else {
                trace!("Connection {} closed, skipping {}", handle.id, event.kind());
            }
        }
        delivered
    }

    pub async fn connection_count(&self, user_id: UserId) -> usize {
        self.inner
            .read()
            .await
            .channels
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.connection_count(user_id).await > 0
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called, including
    /// when it already was.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closing.subscribe();
        async move {
            let _ = rx.wait_for(|closing| *closing).await;
        }
    }

    /// Drop every registered handle, refuse new registrations and tell every
    /// connection writer to close.
    pub async fn shutdown(&self) {
        let mut state = self.inner.write().await;
        let count = state.owners.len();
        state.channels.clear();
        state.owners.clear();
        state.shut_down = true;
        self.closing.send_replace(true);
        info!("Channel registry shut down ({} connections released)", count);
    }
}

impl RegistryState {
    fn remove_conn(&mut self, user_id: UserId, conn_id: Uuid) {
        if let Some(conns) = self.channels.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                self.channels.remove(&user_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ping(n: i64) -> GatewayEvent {
        GatewayEvent::Connected {
            user_id: n,
            message: "ping".into(),
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = ChannelRegistry::new();
        let (handle, _rx) = ConnectionHandle::new();

        assert_eq!(registry.register(1, &handle).await, Registration::Added);
        assert_eq!(registry.register(1, &handle).await, Registration::Unchanged);
        assert_eq!(registry.connection_count(1).await, 1);
    }

    #[tokio::test]
    async fn publish_reaches_every_device() {
        let registry = ChannelRegistry::new();
        let (phone, mut phone_rx) = ConnectionHandle::new();
        let (laptop, mut laptop_rx) = ConnectionHandle::new();
        let (other, mut other_rx) = ConnectionHandle::new();

        registry.register(1, &phone).await;
        registry.register(1, &laptop).await;
        registry.register(2, &other).await;

        assert_eq!(registry.publish(1, ping(1)).await, 2);
        assert_eq!(phone_rx.try_recv().unwrap(), ping(1));
        assert_eq!(laptop_rx.try_recv().unwrap(), ping(1));
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn n_registers_then_n_unregisters_leaves_user_offline() {
        let registry = ChannelRegistry::new();
        let handles: Vec<_> = (0..5).map(|_| ConnectionHandle::new()).collect();

        for (h, _) in &handles {
            registry.register(7, h).await;
        }
        assert_eq!(registry.connection_count(7).await, 5);

        for (h, _) in &handles {
            assert_eq!(registry.unregister(h).await, Some(7));
        }
        assert_eq!(registry.connection_count(7).await, 0);
        assert!(!registry.is_online(7).await);

        // Offline publish is a silent no-op
        assert_eq!(registry.publish(7, ping(7)).await, 0);
    }

    #[tokio::test]
    async fn unregister_unknown_handle_is_noop() {
        let registry = ChannelRegistry::new();
        let (handle, _rx) = ConnectionHandle::new();
        assert_eq!(registry.unregister(&handle).await, None);
    }

    #[tokio::test]
    async fn closed_connection_does_not_block_others() {
        let registry = ChannelRegistry::new();
        let (dead, dead_rx) = ConnectionHandle::new();
        let (alive, mut alive_rx) = ConnectionHandle::new();
        registry.register(3, &dead).await;
        registry.register(3, &alive).await;

        drop(dead_rx);
        assert!(dead.is_closed());

        assert_eq!(registry.publish(3, ping(3)).await, 1);
        assert_eq!(alive_rx.try_recv().unwrap(), ping(3));
    }

    #[tokio::test]
    async fn reregistering_under_new_user_moves_handle() {
        let registry = ChannelRegistry::new();
        let (handle, _rx) = ConnectionHandle::new();
        registry.register(1, &handle).await;
        registry.register(2, &handle).await;

        assert_eq!(registry.connection_count(1).await, 0);
        assert_eq!(registry.connection_count(2).await, 1);
    }

    #[tokio::test]
    async fn shutdown_signals_and_refuses_new_handles() {
        let registry = ChannelRegistry::new();
        let (handle, _rx) = ConnectionHandle::new();
        registry.register(1, &handle).await;

        let waiter = tokio::spawn(registry.closed());
        registry.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() did not resolve")
            .unwrap();

        // Late subscribers resolve immediately
        tokio::time::timeout(Duration::from_secs(1), registry.closed())
            .await
            .unwrap();

        assert_eq!(registry.publish(1, ping(1)).await, 0);
        let (late, _late_rx) = ConnectionHandle::new();
        assert_eq!(registry.register(1, &late).await, Registration::Refused);
        assert!(!registry.is_online(1).await);
    }

    #[tokio::test]
    async fn concurrent_register_and_unregister() {
        let registry = ChannelRegistry::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = ConnectionHandle::new();
                registry.register(i % 4, &handle).await;
                registry.publish(i % 4, ping(i)).await;
                registry.unregister(&handle).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        for uid in 0..4 {
            assert!(!registry.is_online(uid).await);
        }
    }
}
