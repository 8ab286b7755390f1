//! Relay Client
//!
//! An actor that owns the WebSocket to the relay and cycles
//! `Disconnected → Connecting → Connected → Disconnected`. On every connect it
//! re-joins the current group and starts heartbeats; any close or error
//! schedules a reconnect after a fixed backoff. Reconnection is driven by
//! transport closure only; a missing `pong` never forces one.

use futures::{SinkExt, StreamExt};
use futures::stream::SplitSink;
use std::time::Duration;
use tabshare_protocol::{ClientMessage, ServerMessage, TabPayload, decode_server, encode};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tracing::{debug, info, warn};

use crate::config::RelayClientConfig;
use crate::error::ClientError;
use crate::session::{ConnectionState, ReconnectGate, SessionStatus, Suppressed};

/// Upper bound on a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;

#[derive(Debug)]
enum Command {
    Join(String),
    Leave,
    /// Replies once the frame is written, or with `NotConnected` if the
    /// transport is down by the time the actor sees it.
    Send(ClientMessage, oneshot::Sender<Result<(), ClientError>>),
    Reconnect,
    Shutdown,
}

/// How the disconnected wait ended.
enum Wake {
    Connect,
    Shutdown,
}

/// How a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Shutdown,
}

/// Cloneable handle to the relay client actor.
#[derive(Clone)]
pub struct RelayHandle {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    events_tx: broadcast::Sender<ServerMessage>,
}

impl RelayHandle {
    /// Join `group_id`, leaving the current group first if it differs.
    ///
    /// The group is remembered and re-joined after every reconnect.
    pub async fn join(&self, group_id: impl Into<String>) -> Result<(), ClientError> {
        self.command(Command::Join(group_id.into())).await
    }

    pub async fn leave(&self) -> Result<(), ClientError> {
        self.command(Command::Leave).await
    }

    /// Send an envelope on the live connection.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        if !self.status_rx.borrow().is_connected() {
            return Err(ClientError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send(msg, reply)).await?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub async fn share_tab(&self, data: TabPayload) -> Result<(), ClientError> {
        self.send(ClientMessage::ShareTab { data }).await
    }

    pub async fn annotate(&self, data: serde_json::Value) -> Result<(), ClientError> {
        self.send(ClientMessage::AnnotationCreated { data }).await
    }

    pub async fn publish_clusters(&self, data: serde_json::Value) -> Result<(), ClientError> {
        self.send(ClientMessage::AiClusterUpdate { data }).await
    }

    /// Ask for an immediate connection attempt. Suppressed while an attempt
    /// is in flight or within the cooldown of the previous one.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Reconnect).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Subscribe to every envelope the relay sends.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events_tx.subscribe()
    }

    /// Resolve once the transport is connected.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut rx = self.status_rx.clone();
        rx.wait_for(SessionStatus::is_connected)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    async fn command(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ClientError::Closed)
    }

    /// A handle that reports `status` but has no actor behind it.
    #[cfg(test)]
    pub(crate) fn detached(status: SessionStatus) -> Self {
        let (cmd_tx, _) = mpsc::channel(1);
        let (_, status_rx) = watch::channel(status);
        let (events_tx, _) = broadcast::channel(16);
        Self {
            cmd_tx,
            status_rx,
            events_tx,
        }
    }
}

/// Spawn the relay client actor. It connects immediately.
pub fn spawn_relay_client(config: RelayClientConfig) -> (RelayHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(SessionStatus::default());
    let (events_tx, _) = broadcast::channel(256);

    let client = RelayClient {
        gate: ReconnectGate::new(config.reconnect_cooldown),
        config,
        cmd_rx,
        status_tx,
        events_tx: events_tx.clone(),
    };
    let task = tokio::spawn(client.run());

    (
        RelayHandle {
            cmd_tx,
            status_rx,
            events_tx,
        },
        task,
    )
}

struct RelayClient {
    config: RelayClientConfig,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<ServerMessage>,
    gate: ReconnectGate,
}

impl RelayClient {
    async fn run(mut self) {
        let mut delay = Duration::ZERO;
        loop {
            if let Wake::Shutdown = self.wait_disconnected(delay).await {
                break;
            }

            match self.gate.try_begin(Instant::now()) {
                Ok(()) => {}
                Err(Suppressed::Cooldown(remaining)) => {
                    debug!("Connection attempt suppressed, cooling down for {:?}", remaining);
                    delay = remaining;
                    continue;
                }
                Err(Suppressed::InFlight) => {
                    delay = self.config.reconnect_cooldown;
                    continue;
                }
            }

            self.set_state(ConnectionState::Connecting);
            let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
            let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect).await;
            self.gate.finish();

            let end = match attempt {
                Ok(Ok((ws, _response))) => {
                    info!(url = %self.config.url, "Connected to relay");
                    self.run_session(ws).await
                }
                Ok(Err(e)) => {
                    warn!(url = %self.config.url, "Relay connection failed: {}", e);
                    SessionEnd::Closed
                }
                Err(_) => {
                    warn!(url = %self.config.url, "Relay connection timed out");
                    SessionEnd::Closed
                }
            };

            self.status_tx.send_modify(|s| {
                s.state = ConnectionState::Disconnected;
                s.client_id = None;
                s.member_count = None;
            });
            if end == SessionEnd::Shutdown {
                break;
            }
            info!("Reconnecting to relay in {:?}", self.config.reconnect_backoff);
            delay = self.config.reconnect_backoff;
        }
        debug!("Relay client stopped");
    }

    /// Wait out `delay` while disconnected, still honouring commands.
    async fn wait_disconnected(&mut self, delay: Duration) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Wake::Connect,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Join(group_id)) => self.set_group(Some(group_id)),
                    Some(Command::Leave) => self.set_group(None),
                    Some(Command::Send(msg, reply)) => {
                        debug!("Refusing {:?}: not connected", msg);
                        let _ = reply.send(Err(ClientError::NotConnected));
                    }
                    Some(Command::Reconnect) => return Wake::Connect,
                    Some(Command::Shutdown) | None => return Wake::Shutdown,
                },
            }
        }
    }

    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        self.set_state(ConnectionState::Connected);

        let rejoin = self.status_tx.borrow().group_id.clone();
        if let Some(group_id) = rejoin {
            info!(group = %group_id, "Re-joining group");
            if send_envelope(&mut write, &ClientMessage::JoinGroup { group_id })
                .await
                .is_err()
            {
                return SessionEnd::Closed;
            }
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = send_envelope(&mut write, &ClientMessage::Heartbeat).await {
                        debug!("Heartbeat failed: {}", e);
                        return SessionEnd::Closed;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match decode_server(text.as_str()) {
                            Ok(msg) => self.handle_inbound(msg),
                            Err(e) => warn!("Ignoring malformed envelope from relay: {}", e),
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        info!("Relay closed the connection");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay connection error: {}", e);
                        return SessionEnd::Closed;
                    }
                },
                cmd = self.cmd_rx.recv() => {
                    let result = match cmd {
                        Some(Command::Join(group_id)) => {
                            self.switch_group(&mut write, Some(group_id)).await
                        }
                        Some(Command::Leave) => self.switch_group(&mut write, None).await,
                        Some(Command::Send(msg, reply)) => {
                            let result = send_envelope(&mut write, &msg).await;
                            if let Err(e) = &result {
                                warn!("Send to relay failed: {}", e);
                            }
                            let failed = result.is_err();
                            let _ = reply.send(result);
                            if failed {
                                return SessionEnd::Closed;
                            }
                            Ok(())
                        }
                        Some(Command::Reconnect) => {
                            debug!("Already connected, ignoring reconnect request");
                            Ok(())
                        }
                        Some(Command::Shutdown) | None => {
                            let _ = write.close().await;
                            return SessionEnd::Shutdown;
                        }
                    };
                    if let Err(e) = result {
                        warn!("Send to relay failed: {}", e);
                        return SessionEnd::Closed;
                    }
                }
            }
        }
    }

    async fn switch_group(
        &mut self,
        write: &mut WsSink,
        next: Option<String>,
    ) -> Result<(), ClientError> {
        let current = self.status_tx.borrow().group_id.clone();
        if let Some(old) = current.filter(|old| Some(old) != next.as_ref()) {
            send_envelope(write, &ClientMessage::LeaveGroup { group_id: old }).await?;
        }
        self.set_group(next.clone());
        if let Some(group_id) = next {
            send_envelope(write, &ClientMessage::JoinGroup { group_id }).await?;
        }
        Ok(())
    }

    fn handle_inbound(&mut self, msg: ServerMessage) {
        match &msg {
            ServerMessage::Welcome { client_id } => {
                debug!(client_id = %client_id, "Relay assigned client id");
                let client_id = client_id.clone();
                self.status_tx.send_modify(|s| s.client_id = Some(client_id));
            }
            ServerMessage::GroupJoined { member_count, .. }
            | ServerMessage::MemberJoined { member_count, .. }
            | ServerMessage::MemberLeft { member_count, .. } => {
                let count = *member_count;
                self.status_tx.send_modify(|s| s.member_count = Some(count));
            }
            ServerMessage::Pong => debug!("Heartbeat acknowledged"),
            _ => {}
        }
        // No subscribers is fine.
        let _ = self.events_tx.send(msg);
    }

    fn set_state(&self, state: ConnectionState) {
        self.status_tx.send_modify(|s| s.state = state);
    }

    fn set_group(&self, group_id: Option<String>) {
        self.status_tx.send_modify(|s| {
            if group_id.is_none() {
                s.member_count = None;
            }
            s.group_id = group_id;
        });
    }
}

async fn send_envelope(write: &mut WsSink, msg: &ClientMessage) -> Result<(), ClientError> {
    let text = encode(msg)?;
    write.send(tungstenite::Message::Text(text.into())).await?;
    Ok(())
}
