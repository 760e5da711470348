use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use chatline_types::UserId;
use chatline_types::events::{GatewayCommand, GatewayEvent};

use crate::reconnect::{DisconnectReason, ReconnectAction, ReconnectPolicy, Reconnector};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// `ws://` or `wss://` gateway endpoint, without the token
    pub gateway_url: String,
    pub token: String,
    pub user_id: UserId,
    pub policy: ReconnectPolicy,
}

impl DriverConfig {
    /// Derive the gateway endpoint from the REST base URL.
    pub fn from_base_url(base_url: &str, token: impl Into<String>, user_id: UserId) -> Self {
        let base = base_url.trim_end_matches('/');
        let gateway_url = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}/gateway", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}/gateway", rest)
        } else {
            format!("{}/gateway", base)
        };
        Self {
            gateway_url,
            token: token.into(),
            user_id,
            policy: ReconnectPolicy::default(),
        }
    }

    fn connect_url(&self) -> String {
        format!("{}?token={}", self.gateway_url, self.token)
    }
}

/// What the driver reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Join acknowledged. History should be refetched here, since anything
    /// sent while disconnected was not delivered live.
    Joined,
    Event(GatewayEvent),
    Reconnecting { attempt: u32, delay: Duration },
    /// Retry budget exhausted
    GaveUp,
    Closed,
}

#[derive(Debug)]
enum DriverCommand {
    Send(GatewayCommand),
    Close,
}

/// Handle to a running driver task.
#[derive(Clone)]
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<DriverCommand>,
}

impl GatewayClient {
    /// Spawn the connection driver. Events arrive on the returned receiver
    /// until it reports `Closed` or `GaveUp`.
    pub fn spawn(config: DriverConfig) -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_driver(config, cmd_rx, event_tx));
        (Self { commands: cmd_tx }, event_rx)
    }

    /// Queue a command. Commands issued while disconnected are dropped; the
    /// caller's pending entry stays unconfirmed.
    pub fn send(&self, command: GatewayCommand) -> bool {
        self.commands.send(DriverCommand::Send(command)).is_ok()
    }

    /// Client-initiated close. The driver does not reconnect afterwards.
    pub fn close(&self) {
        let _ = self.commands.send(DriverCommand::Close);
    }
}

async fn run_driver(
    config: DriverConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<DriverCommand>,
    event_tx: mpsc::UnboundedSender<DriverEvent>,
) {
    let mut reconnector = Reconnector::new(config.policy);

    loop {
        reconnector.on_connecting();
        info!("Connecting to gateway {}", config.gateway_url);

        let reason = match tokio_tungstenite::connect_async(config.connect_url()).await {
            Ok((ws, _)) => {
                reconnector.on_connected();
                run_connection(ws, &config, &mut reconnector, &mut cmd_rx, &event_tx).await
            }
            Err(err) => {
                warn!("Gateway connect failed: {}", err);
                DisconnectReason::ConnectError
            }
        };

        match reconnector.on_disconnect(reason) {
            ReconnectAction::Stop => {
                let _ = event_tx.send(DriverEvent::Closed);
                return;
            }
            ReconnectAction::GiveUp => {
                warn!("Gateway reconnect attempts exhausted");
                let _ = event_tx.send(DriverEvent::GaveUp);
                return;
            }
            ReconnectAction::RetryAfter(delay) => {
                let attempt = reconnector.attempts();
                info!("Gateway reconnect {} in {:?}", attempt, delay);
                let _ = event_tx.send(DriverEvent::Reconnecting { attempt, delay });

                if !backoff(delay, &mut cmd_rx).await {
                    reconnector.close();
                    let _ = event_tx.send(DriverEvent::Closed);
                    return;
                }
            }
        }
    }
}

/// Sleep out the backoff delay. Returns false if the client closed meanwhile.
async fn backoff(delay: Duration, cmd_rx: &mut mpsc::UnboundedReceiver<DriverCommand>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = cmd_rx.recv() => match cmd {
                None | Some(DriverCommand::Close) => return false,
                Some(DriverCommand::Send(cmd)) => {
                    warn!("Gateway offline, dropping command {:?}", cmd);
                }
            },
        }
    }
}

async fn run_connection<S>(
    mut ws: tokio_tungstenite::WebSocketStream<S>,
    config: &DriverConfig,
    reconnector: &mut Reconnector,
    cmd_rx: &mut mpsc::UnboundedReceiver<DriverCommand>,
    event_tx: &mpsc::UnboundedSender<DriverEvent>,
) -> DisconnectReason
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    // Join state never survives a reconnect
    let join = GatewayCommand::Join {
        user_id: config.user_id,
    };
    if send_command(&mut ws, &join).await.is_err() {
        return DisconnectReason::Abnormal;
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(DriverCommand::Close) => {
                        let _ = ws.close(None).await;
                        return DisconnectReason::ClientClosed;
                    }
                    Some(DriverCommand::Send(cmd)) => {
                        if let Err(err) = send_command(&mut ws, &cmd).await {
                            warn!("Gateway send failed: {}", err);
                            return DisconnectReason::Abnormal;
                        }
                    }
                }
            }
            msg = ws.next() => {
                let Some(msg) = msg else {
                    warn!("Gateway websocket closed");
                    return DisconnectReason::Abnormal;
                };
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match serde_json::from_str::<GatewayEvent>(text.as_str()) {
                            Ok(event) => event,
                            Err(err) => {
                                warn!("Unrecognised gateway event: {}", err);
                                continue;
                            }
                        };
                        if matches!(event, GatewayEvent::Connected { .. }) {
                            reconnector.on_joined();
                            let _ = event_tx.send(DriverEvent::Joined);
                        }
                        let _ = event_tx.send(DriverEvent::Event(event));
                    }
                    Ok(Message::Close(frame)) => {
                        warn!("Gateway websocket closed: {:?}", frame);
                        return DisconnectReason::Abnormal;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("Gateway websocket error: {}", err);
                        return DisconnectReason::Abnormal;
                    }
                }
            }
        }
    }
}

async fn send_command<S>(
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    cmd: &GatewayCommand,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = serde_json::to_string(cmd)?;
    debug!("Gateway send ({} bytes)", text.len());
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}
