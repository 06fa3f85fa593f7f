//! WebSocket sync server with workspace-scoped event routing.
//!
//! Architecture:
//! ```text
//! persistence layer ── CommittedChange ──▶ EventDispatcher
//!                                              │ encode once
//!                                              ▼
//!                                WorkspaceRooms (workspace → broadcast)
//!                                 │              │
//!                          room P1 rx       room P3 rx       one forwarder
//!                                 │              │           task per joined
//!                                 ▼              ▼           workspace
//!                         connection outbound queue ──▶ WebSocket ──▶ client
//! ```
//!
//! A connection must open with `hello`. Once authenticated it is bound to
//! the principal's session id; a newer connection for the same session
//! supersedes and closes the older one.

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{AccessPolicy, AuthDecision, Authenticator, Principal};
use crate::broadcast::{SharedFrame, WorkspaceRooms};
use crate::dispatcher::EventDispatcher;
use crate::protocol::{ControlMessage, Frame, SessionId, WorkspaceId};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session per room before it starts lagging
    pub broadcast_capacity: usize,
    /// Time allowed for the `hello` frame after upgrade
    pub handshake_timeout_ms: u64,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            handshake_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_handshakes: u64,
    pub superseded_connections: u64,
    pub active_rooms: usize,
}

enum Outbound {
    Frame(SharedFrame),
    Close,
}

struct SessionHandle {
    connection: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

struct Shared {
    config: ServerConfig,
    rooms: Arc<WorkspaceRooms>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    authenticator: Arc<dyn Authenticator>,
    policy: Arc<dyn AccessPolicy>,
    stats: RwLock<ServerStats>,
    next_connection: AtomicU64,
}

/// The sync server. Clones share the same rooms and sessions.
#[derive(Clone)]
pub struct SyncServer {
    shared: Arc<Shared>,
    dispatcher: EventDispatcher,
}

impl SyncServer {
    /// Create a server whose directory both authenticates and authorizes.
    pub fn new<D>(config: ServerConfig, directory: Arc<D>) -> Self
    where
        D: Authenticator + AccessPolicy,
    {
        Self::with_collaborators(config, directory.clone(), directory)
    }

    pub fn with_collaborators(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        let rooms = Arc::new(WorkspaceRooms::new(config.broadcast_capacity));
        let dispatcher = EventDispatcher::new(rooms.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                sessions: RwLock::new(HashMap::new()),
                authenticator,
                policy,
                stats: RwLock::new(ServerStats::default()),
                next_connection: AtomicU64::new(1),
            }),
            dispatcher,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Handle for the persistence layer to publish committed changes.
    pub fn dispatcher(&self) -> EventDispatcher {
        self.dispatcher.clone()
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Close the session's transport and drop it from every room.
    pub async fn disconnect_session(&self, session: &SessionId) -> bool {
        match self.shared.sessions.read().await.get(session) {
            Some(handle) => {
                log::info!("disconnecting session {session}");
                handle.tx.send(Outbound::Close).is_ok()
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, session: &SessionId) -> bool {
        self.shared.sessions.read().await.contains_key(session)
    }

    pub async fn workspace_session_count(&self, workspace: &WorkspaceId) -> usize {
        self.shared.rooms.session_count(workspace).await
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }
}

fn control_frame(msg: &ControlMessage) -> Option<SharedFrame> {
    match msg.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            log::error!("failed to encode {msg:?}: {e}");
            None
        }
    }
}

fn send_control(tx: &mpsc::UnboundedSender<Outbound>, msg: &ControlMessage) {
    if let Some(frame) = control_frame(msg) {
        let _ = tx.send(Outbound::Frame(frame));
    }
}

async fn send_direct(sink: &mut WsSink, msg: &ControlMessage) -> Result<(), BoxError> {
    if let Some(frame) = control_frame(msg) {
        sink.send(Message::text(frame.to_string())).await?;
    }
    Ok(())
}

/// Next text frame, or `None` once the peer is gone.
async fn next_text(source: &mut WsSource) -> Option<String> {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.as_str().to_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Wait for `hello` and resolve it to a principal. Rejections are answered
/// on the socket before returning `None`.
async fn handshake(shared: &Shared, sink: &mut WsSink, source: &mut WsSource) -> Option<Principal> {
    let first = tokio::time::timeout(shared.config.handshake_timeout(), next_text(source)).await;
    let rejection = match first {
        Err(_) => "handshake timed out".to_string(),
        Ok(None) => return None,
        Ok(Some(text)) => match Frame::decode(&text) {
            Ok(Frame::Control(ControlMessage::Hello { token })) => {
                match shared.authenticator.authenticate(&token) {
                    AuthDecision::Accepted(principal) => return Some(principal),
                    AuthDecision::Rejected(reason) => reason,
                }
            }
            _ => "first frame must be hello".to_string(),
        },
    };

    log::warn!("handshake rejected: {rejection}");
    shared.stats.write().await.rejected_handshakes += 1;
    let _ = send_direct(sink, &ControlMessage::AuthRejected { reason: rejection }).await;
    let _ = sink.send(Message::Close(None)).await;
    None
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();

    let Some(principal) = handshake(&shared, &mut sink, &mut source).await else {
        return Ok(());
    };
    let session = principal.session_id;
    let connection = shared.next_connection.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let superseded = shared.sessions.write().await.insert(
        session,
        SessionHandle {
            connection,
            tx: tx.clone(),
        },
    );
    if let Some(old) = superseded {
        log::info!("session {session} reconnected; closing previous transport");
        let _ = old.tx.send(Outbound::Close);
        for workspace in shared.rooms.active_workspaces().await {
            shared.rooms.leave(&workspace, &session).await;
        }
        shared.stats.write().await.superseded_connections += 1;
    }

    {
        let mut stats = shared.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    send_direct(&mut sink, &ControlMessage::Welcome { session_id: session }).await?;
    log::info!("{} authenticated as session {session} from {addr}", principal.user);

    let mut forwarders: HashMap<WorkspaceId, JoinHandle<()>> = HashMap::new();
    let heartbeat_every = shared.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval(heartbeat_every);
    heartbeat.reset();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        shared.stats.write().await.total_messages += 1;
                        handle_client_frame(&shared, &principal, text.as_str(), &tx, &mut forwarders).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("transport error for session {session}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            out = rx.recv() => {
                match out {
                    Some(Outbound::Frame(frame)) => {
                        if sink.send(Message::text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_every * 3 {
                    log::warn!("session {session} missed heartbeats; closing");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    for handle in forwarders.values() {
        handle.abort();
    }
    {
        let mut sessions = shared.sessions.write().await;
        let owned = sessions
            .get(&session)
            .is_some_and(|h| h.connection == connection);
        if owned {
            sessions.remove(&session);
            for workspace in forwarders.keys() {
                shared.rooms.leave(workspace, &session).await;
            }
        }
    }
    {
        let mut stats = shared.stats.write().await;
        stats.active_connections = stats.active_connections.saturating_sub(1);
    }

    log::info!("session {session} disconnected ({addr})");
    Ok(())
}

async fn handle_client_frame(
    shared: &Shared,
    principal: &Principal,
    text: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    forwarders: &mut HashMap<WorkspaceId, JoinHandle<()>>,
) {
    let session = principal.session_id;
    match Frame::decode(text) {
        Ok(Frame::Control(ControlMessage::JoinWorkspace { workspace_id })) => {
            if let Err(reason) = shared.policy.authorize_join(principal, &workspace_id) {
                log::info!("session {session} denied {workspace_id}: {reason}");
                send_control(
                    tx,
                    &ControlMessage::WorkspaceJoinRejected {
                        workspace_id,
                        reason,
                    },
                );
                return;
            }
            if forwarders.contains_key(&workspace_id) {
                log::debug!("session {session} re-joined {workspace_id}");
                send_control(tx, &ControlMessage::WorkspaceJoined { workspace_id });
                return;
            }

            let room_rx = match shared.rooms.join(&workspace_id, session).await {
                Some(rx) => rx,
                None => {
                    // Stale membership from a transport that is still closing.
                    shared.rooms.leave(&workspace_id, &session).await;
                    match shared.rooms.join(&workspace_id, session).await {
                        Some(rx) => rx,
                        None => return,
                    }
                }
            };
            // Ack is queued before the forwarder can queue any event.
            send_control(
                tx,
                &ControlMessage::WorkspaceJoined {
                    workspace_id: workspace_id.clone(),
                },
            );
            let handle = spawn_forwarder(shared.rooms.clone(), workspace_id.clone(), room_rx, tx.clone());
            forwarders.insert(workspace_id.clone(), handle);
            log::info!("session {session} joined {workspace_id}");
        }
        Ok(Frame::Control(ControlMessage::LeaveWorkspace { workspace_id })) => {
            if let Some(handle) = forwarders.remove(&workspace_id) {
                handle.abort();
                shared.rooms.leave(&workspace_id, &session).await;
                log::info!("session {session} left {workspace_id}");
            }
            send_control(tx, &ControlMessage::WorkspaceLeft { workspace_id });
        }
        Ok(Frame::Control(ControlMessage::Ping)) => send_control(tx, &ControlMessage::Pong),
        Ok(Frame::Control(other)) => log::debug!("session {session} sent unexpected {other:?}"),
        Ok(Frame::Event(event)) => {
            log::warn!("session {session} tried to publish {}; ignored", event.kind);
        }
        Err(e) => log::warn!("dropping frame from session {session}: {e}"),
    }
}

fn spawn_forwarder(
    rooms: Arc<WorkspaceRooms>,
    workspace: WorkspaceId,
    mut room_rx: broadcast::Receiver<SharedFrame>,
    tx: mpsc::UnboundedSender<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match room_rx.recv().await {
                Ok(frame) => {
                    if tx.send(Outbound::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("session lagged {skipped} frame(s) in {workspace}");
                    if let Some(room) = rooms.get(&workspace).await {
                        room.record_dropped(skipped);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
