use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};

use chatline_types::UserId;
use chatline_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatch::{Delivery, MessageDispatcher};
use crate::error::DispatchError;
use crate::registry::ConnectionHandle;
use crate::session::Session;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle one WebSocket connection whose token was already validated at the
/// HTTP upgrade layer. The connection starts in `Connecting` and only
/// receives channel traffic after the client sends `Join`.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: MessageDispatcher,
    user_id: UserId,
    username: String,
) {
    let (sender, mut receiver) = socket.split();
    let (handle, conn_rx) = ConnectionHandle::new();
    let conn_id = handle.id();

    info!("{} ({}) connected on {}", username, user_id, conn_id);

    let session = Arc::new(Mutex::new(Session::new(
        dispatcher.registry().clone(),
        handle,
        user_id,
    )));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events -> client, with heartbeat
    let closed = dispatcher.registry().closed();
    let mut send_task = tokio::spawn(run_writer(sender, conn_rx, pong_flag_send, closed));

    // Read commands from client
    let recv_session = session.clone();
    let recv_dispatcher = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let mut session = recv_session.lock().await;
                    handle_text(&mut session, &recv_dispatcher, text.as_str()).await;
                }
                Message::Binary(data) => {
                    warn!("Connection {} sent {} byte binary frame, ignoring", conn_id, data.len());
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    session.lock().await.disconnect().await;
    info!("{} ({}) disconnected from {}", username, user_id, conn_id);
}

/// Drain queued events to the socket and ping every [`HEARTBEAT_INTERVAL`].
///
/// Ends when the queue closes, the socket fails, two pongs are missed, or
/// `closed` resolves on registry shutdown. The queue receiver is dropped on
/// return.
async fn run_writer<S, F>(
    mut sender: S,
    mut conn_rx: mpsc::UnboundedReceiver<GatewayEvent>,
    pong_received: Arc<AtomicBool>,
    closed: F,
) where
    S: Sink<Message> + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(closed);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            _ = &mut closed => {
                info!("Server shutting down, closing connection");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            event = conn_rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize {}: {}", event.kind(), e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Parse and handle one text frame. Malformed frames are reported back to
/// this connection only.
pub async fn handle_text(session: &mut Session, dispatcher: &MessageDispatcher, text: &str) {
    match serde_json::from_str::<GatewayCommand>(text) {
        Ok(cmd) => handle_command(session, dispatcher, cmd).await,
        Err(e) => {
            warn!(
                "Connection {} bad command: {} -- raw: {}",
                session.handle().id(),
                e,
                truncate(text, 200)
            );
            session.handle().send(GatewayEvent::error("Malformed command"));
        }
    }
}

/// Handle one command. Commands on a single connection are processed in
/// order, so a sender's direct messages are persisted in emission order.
pub async fn handle_command(session: &mut Session, dispatcher: &MessageDispatcher, cmd: GatewayCommand) {
    match cmd {
        GatewayCommand::Join { user_id } => {
            if let Err(e) = session.join(user_id).await {
                warn!("Connection {} join as {} refused: {}", session.handle().id(), user_id, e);
                session.handle().send(GatewayEvent::error(e.to_string()));
            }
        }

        GatewayCommand::DirectMessage {
            sender_id,
            receiver_id,
            content,
            timestamp,
            client_nonce,
        } => {
            let Some(sender_id) = authorize(session, sender_id) else {
                return;
            };
            let dispatcher = dispatcher.clone();
            let result = detached(async move {
                dispatcher
                    .send_direct(sender_id, receiver_id, content, timestamp, client_nonce)
                    .await
            })
            .await;
            if let Err(e) = result {
                warn!("Direct message {} -> {} failed: {}", sender_id, receiver_id, e);
                session.handle().send(GatewayEvent::error(e.client_message()));
            }
        }

        GatewayCommand::GroupMessage {
            sender_id,
            group_id,
            content,
            timestamp,
            client_nonce,
        } => {
            let Some(sender_id) = authorize(session, sender_id) else {
                return;
            };
            let dispatcher = dispatcher.clone();
            let result = detached(async move {
                dispatcher
                    .send_group(sender_id, group_id, content, timestamp, client_nonce)
                    .await
            })
            .await;
            if let Err(e) = result {
                warn!("Group message {} -> group {} failed: {}", sender_id, group_id, e);
                session.handle().send(GatewayEvent::error(e.client_message()));
            }
        }
    }
}

fn authorize(session: &Session, sender_id: UserId) -> Option<UserId> {
    match session.authorize_sender(sender_id) {
        Ok(uid) => Some(uid),
        Err(e) => {
            session.handle().send(GatewayEvent::error(e.to_string()));
            None
        }
    }
}

/// Dispatch on its own task so a connection torn down mid-message does not
/// cancel fan-out to everyone else. Awaited, so per-connection order holds.
async fn detached<F>(fut: F) -> Result<Delivery, DispatchError>
where
    F: Future<Output = Result<Delivery, DispatchError>> + Send + 'static,
{
    tokio::spawn(fut).await.map_err(|e| {
        error!("Dispatch task failed: {}", e);
        DispatchError::Internal(e.to_string())
    })?
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
