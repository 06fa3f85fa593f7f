//! WebSocket sync client.
//!
//! Once connected, two background tasks run:
//! - the transport supervisor owns the socket, sends heartbeat pings and
//!   reconnects with bounded exponential backoff;
//! - the session runtime owns the [`ClientSession`] and is the only task
//!   that touches subscription, reconciliation or mutation state.
//!
//! [`SyncClient`] is the handle the application calls into. Every call is a
//! message to the runtime, so callers never share state with it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::cache::{CacheReader, CacheStore};
use crate::error::SyncError;
use crate::feed::{FeedConfig, Notification, NotificationId};
use crate::observer::{ObserverRegistry, SubscriptionToken};
use crate::optimistic::{
    CommandSink, MutationCommand, MutationConfig, MutationOutcome, MutationTicket, Resolution,
    ServerState,
};
use crate::protocol::{ControlMessage, Frame, ResourceId, SessionId, WorkspaceId};
use crate::reconcile::{Invalidation, ReconcileConfig};
use crate::session::ClientSession;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Subscription<T> = (SubscriptionToken, mpsc::UnboundedReceiver<T>);

/// Bounded exponential backoff for reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    /// Attempts before the client gives up and reports offline
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2,
            max_retries: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub reconnect: ReconnectPolicy,
    pub reconcile: ReconcileConfig,
    pub mutation: MutationConfig,
    pub feed: FeedConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            handshake_timeout_ms: 5_000,
            heartbeat_interval_secs: 15,
            reconnect: ReconnectPolicy::default(),
            reconcile: ReconcileConfig::default(),
            mutation: MutationConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

/// Client connection state.
///
/// `Offline` is a distinct terminal state rather than a return to
/// `Disconnected`: the runtime is still alive, membership is remembered and
/// cached values stay readable, but nothing reaches the server until
/// [`SyncClient::disconnect`] and a fresh [`SyncClient::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; stays here until `disconnect`.
    Offline,
}

/// Connection lifecycle signals.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected { session_id: SessionId },
    Lost,
    Reconnecting { attempt: u32, delay: Duration },
    Offline { error: SyncError },
}

/// Observer streams, for [`SyncClient::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Invalidations,
    Outcomes,
    Connection,
    Alerts,
}

fn not_connected() -> SyncError {
    SyncError::Connection("client is not connected".to_string())
}

fn finish_mutation(
    outcome: Result<MutationOutcome, oneshot::error::RecvError>,
) -> Result<Option<Value>, SyncError> {
    match outcome.map_err(|_| not_connected())?.resolution {
        Resolution::Confirmed { state } => Ok(state),
        Resolution::RolledBack { error, .. } => Err(error),
    }
}

// ── session runtime ───────────────────────────────────────────────────

type PendingMutation = (MutationTicket, oneshot::Receiver<MutationOutcome>);

enum Command {
    Join(WorkspaceId, oneshot::Sender<Result<(), SyncError>>),
    Leave(WorkspaceId),
    BeginMutation {
        resource: ResourceId,
        desired: Value,
        reply: oneshot::Sender<Result<PendingMutation, SyncError>>,
    },
    ResolveMutation {
        resource: ResourceId,
        id: Uuid,
        result: Result<ServerState, SyncError>,
    },
    Notifications(oneshot::Sender<Vec<Notification>>),
    Dismiss(NotificationId, oneshot::Sender<bool>),
    MarkAllRead,
    SubscribeInvalidations(oneshot::Sender<Subscription<Invalidation>>),
    SubscribeOutcomes(oneshot::Sender<Subscription<MutationOutcome>>),
    SubscribeConnection(oneshot::Sender<Subscription<ConnectionEvent>>),
    SubscribeAlerts(oneshot::Sender<Subscription<SyncError>>),
    Unsubscribe(Topic, SubscriptionToken),
    Shutdown,
}

#[derive(Debug)]
enum TransportInput {
    Connected(SessionId),
    Frame(String),
    Lost,
    Reconnecting { attempt: u32, delay: Duration },
    Offline(SyncError),
}

struct SessionRuntime {
    session: ClientSession,
    outbound: mpsc::UnboundedSender<String>,
    connection: ObserverRegistry<ConnectionEvent>,
    outcomes: mpsc::UnboundedReceiver<MutationOutcome>,
    alerts: mpsc::UnboundedReceiver<SyncError>,
    mutation_waiters: HashMap<Uuid, oneshot::Sender<MutationOutcome>>,
    join_waiters: HashMap<WorkspaceId, Vec<oneshot::Sender<Result<(), SyncError>>>>,
    /// Set once reconnecting gave up; later joins fail with it at once.
    offline: Option<SyncError>,
}

impl SessionRuntime {
    fn new(mut session: ClientSession, outbound: mpsc::UnboundedSender<String>) -> Self {
        let (_, outcomes) = session.subscribe_outcomes();
        let (_, alerts) = session.subscribe_alerts();
        Self {
            session,
            outbound,
            connection: ObserverRegistry::new(),
            outcomes,
            alerts,
            mutation_waiters: HashMap::new(),
            join_waiters: HashMap::new(),
            offline: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inputs: mpsc::Receiver<TransportInput>) {
        let mut transport_open = true;
        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                input = inputs.recv(), if transport_open => match input {
                    Some(input) => self.handle_input(input),
                    None => transport_open = false,
                },
                _ = sleep_until(deadline) => {
                    self.session.tick(Instant::now());
                }
            }
            self.settle_waiters();
        }
        self.session.shutdown();
        log::debug!("session runtime stopped");
    }

    fn send(&self, msg: ControlMessage) {
        match msg.encode() {
            Ok(text) => {
                let _ = self.outbound.send(text);
            }
            Err(e) => log::error!("failed to encode {msg:?}: {e}"),
        }
    }

    fn handle_input(&mut self, input: TransportInput) {
        match input {
            TransportInput::Connected(session_id) => {
                self.offline = None;
                for msg in self.session.on_connected(session_id) {
                    self.send(msg);
                }
                self.connection
                    .notify(&ConnectionEvent::Connected { session_id });
            }
            TransportInput::Frame(text) => self.session.handle_text(&text, Instant::now()),
            TransportInput::Lost => {
                let flushed = self.session.on_connection_lost();
                log::info!("transport lost; flushed {} invalidation(s)", flushed.len());
                self.connection.notify(&ConnectionEvent::Lost);
            }
            TransportInput::Reconnecting { attempt, delay } => {
                self.connection
                    .notify(&ConnectionEvent::Reconnecting { attempt, delay });
            }
            TransportInput::Offline(error) => {
                for (_, waiters) in self.join_waiters.drain() {
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
                self.connection.notify(&ConnectionEvent::Offline {
                    error: error.clone(),
                });
                self.offline = Some(error);
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Join(workspace, reply) => {
                if self.session.subscriptions().is_live(&workspace) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                if let Some(error) = &self.offline {
                    // Remembered, but no transport will ever admit it.
                    self.session.join(workspace);
                    let _ = reply.send(Err(error.clone()));
                    return;
                }
                if let Some(msg) = self.session.join(workspace.clone()) {
                    self.send(msg);
                }
                self.join_waiters.entry(workspace).or_default().push(reply);
            }
            Command::Leave(workspace) => {
                self.join_waiters.remove(&workspace);
                if let Some(msg) = self.session.leave(&workspace) {
                    self.send(msg);
                }
            }
            Command::BeginMutation {
                resource,
                desired,
                reply,
            } => {
                let pending = self
                    .session
                    .begin_mutation(resource, desired, now)
                    .map(|ticket| {
                        let (tx, rx) = oneshot::channel();
                        self.mutation_waiters.insert(ticket.id, tx);
                        (ticket, rx)
                    });
                let _ = reply.send(pending);
            }
            Command::ResolveMutation {
                resource,
                id,
                result,
            } => {
                let outcome = match result {
                    Ok(state) => self.session.confirm_mutation(&resource, id, state, now),
                    Err(SyncError::MutationRejected { reason, .. }) => {
                        self.session.reject_mutation(&resource, id, &reason, now)
                    }
                    Err(other) => self
                        .session
                        .reject_mutation(&resource, id, &other.to_string(), now),
                };
                if outcome.is_none() {
                    log::debug!("mutation {id} on {resource} was already resolved");
                }
            }
            Command::Notifications(reply) => {
                let _ = reply.send(self.session.feed().snapshot());
            }
            Command::Dismiss(id, reply) => {
                let _ = reply.send(self.session.feed_mut().dismiss(id));
            }
            Command::MarkAllRead => self.session.feed_mut().mark_all_read(),
            Command::SubscribeInvalidations(reply) => {
                let _ = reply.send(self.session.subscribe_invalidations());
            }
            Command::SubscribeOutcomes(reply) => {
                let _ = reply.send(self.session.subscribe_outcomes());
            }
            Command::SubscribeConnection(reply) => {
                let _ = reply.send(self.connection.subscribe());
            }
            Command::SubscribeAlerts(reply) => {
                let _ = reply.send(self.session.subscribe_alerts());
            }
            Command::Unsubscribe(topic, token) => {
                match topic {
                    Topic::Invalidations => self.session.unsubscribe_invalidations(token),
                    Topic::Outcomes => self.session.unsubscribe_outcomes(token),
                    Topic::Connection => self.connection.unsubscribe(token),
                    Topic::Alerts => self.session.unsubscribe_alerts(token),
                };
            }
            Command::Shutdown => {}
        }
    }

    /// Hand resolved mutations and join results to whoever awaits them.
    fn settle_waiters(&mut self) {
        while let Ok(outcome) = self.outcomes.try_recv() {
            if let Some(waiter) = self.mutation_waiters.remove(&outcome.mutation_id) {
                let _ = waiter.send(outcome);
            }
        }

        while let Ok(alert) = self.alerts.try_recv() {
            if let SyncError::Subscription { workspace, .. } = &alert {
                for waiter in self.join_waiters.remove(workspace).unwrap_or_default() {
                    let _ = waiter.send(Err(alert.clone()));
                }
            }
        }

        let subscriptions = self.session.subscriptions();
        self.join_waiters.retain(|workspace, waiters| {
            if !subscriptions.is_live(workspace) {
                return true;
            }
            for waiter in waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            false
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── transport supervisor ──────────────────────────────────────────────

async fn open_session(config: &ClientConfig, credentials: &Credentials) -> Result<(WsStream, SessionId), SyncError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(config.server_url.as_str()).await?;
    let hello = ControlMessage::Hello {
        token: credentials.token.clone(),
    };
    ws.send(Message::text(hello.encode()?)).await?;

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match Frame::decode(text.as_str()) {
                Ok(Frame::Control(ControlMessage::Welcome { session_id })) => {
                    return Ok((ws, session_id));
                }
                Ok(Frame::Control(ControlMessage::AuthRejected { reason })) => {
                    return Err(SyncError::Connection(format!(
                        "authentication rejected: {reason}"
                    )));
                }
                other => log::debug!("ignoring {other:?} during handshake"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(SyncError::Connection(
        "connection closed during handshake".to_string(),
    ))
}

/// Connect and authenticate within the handshake timeout.
async fn handshake(config: &ClientConfig, credentials: &Credentials) -> Result<(WsStream, SessionId), SyncError> {
    tokio::time::timeout(config.handshake_timeout(), open_session(config, credentials))
        .await
        .map_err(|_| SyncError::Connection("handshake timed out".to_string()))?
}

enum PumpEnd {
    Lost,
    Stopped,
}

struct Transport {
    config: ClientConfig,
    credentials: Credentials,
    state: Arc<RwLock<ConnectionState>>,
    inputs: mpsc::Sender<TransportInput>,
    outbound: mpsc::UnboundedReceiver<String>,
    stop: watch::Receiver<bool>,
}

impl Transport {
    async fn run(mut self, first: WsStream) {
        let mut ws = first;
        loop {
            if let PumpEnd::Stopped = self.pump(ws).await {
                return;
            }
            log::warn!("connection to {} lost", self.config.server_url);
            *self.state.write().await = ConnectionState::Reconnecting;
            if self.inputs.send(TransportInput::Lost).await.is_err() {
                return;
            }
            match self.reconnect().await {
                Some(next) => ws = next,
                None => return,
            }
        }
    }

    async fn pump(&mut self, ws: WsStream) -> PumpEnd {
        let (mut sink, mut source) = ws.split();
        let every = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval(every);
        heartbeat.reset();
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        let input = TransportInput::Frame(text.as_str().to_owned());
                        if self.inputs.send(input).await.is_err() {
                            return PumpEnd::Stopped;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => last_seen = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::Lost,
                    Some(Err(e)) => {
                        log::debug!("transport error: {e}");
                        return PumpEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                },

                out = self.outbound.recv() => match out {
                    Some(text) => {
                        if sink.send(Message::text(text)).await.is_err() {
                            return PumpEnd::Lost;
                        }
                    }
                    None => return close(&mut sink).await,
                },

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > every * 3 {
                        log::warn!("no traffic for {:?}; dropping connection", last_seen.elapsed());
                        return PumpEnd::Lost;
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return PumpEnd::Lost;
                    }
                }

                _ = self.stop.changed() => return close(&mut sink).await,
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        let policy = self.config.reconnect.clone();
        let mut last_error = SyncError::Connection("connection lost".to_string());

        for attempt in 1..=policy.max_retries {
            let delay = policy.delay_for(attempt);
            let _ = self
                .inputs
                .send(TransportInput::Reconnecting { attempt, delay })
                .await;

            let (config, credentials) = (&self.config, &self.credentials);
            let attempt_result = tokio::select! {
                _ = self.stop.changed() => return None,
                result = async {
                    tokio::time::sleep(delay).await;
                    handshake(config, credentials).await
                } => result,
            };

            match attempt_result {
                Ok((ws, session_id)) => {
                    // Anything queued for the dead socket is stale.
                    while self.outbound.try_recv().is_ok() {}
                    *self.state.write().await = ConnectionState::Connected;
                    if self.inputs.send(TransportInput::Connected(session_id)).await.is_err() {
                        return None;
                    }
                    log::info!("reconnected as session {session_id} after {attempt} attempt(s)");
                    return Some(ws);
                }
                Err(e) => {
                    log::warn!("reconnect attempt {attempt}/{} failed: {e}", policy.max_retries);
                    last_error = e;
                }
            }
        }

        log::error!("giving up on {} after {} attempts", self.config.server_url, policy.max_retries);
        *self.state.write().await = ConnectionState::Offline;
        let _ = self.inputs.send(TransportInput::Offline(last_error)).await;
        None
    }
}

async fn close(sink: &mut SplitSink<WsStream, Message>) -> PumpEnd {
    let _ = sink.send(Message::Close(None)).await;
    PumpEnd::Stopped
}

// ── client handle ─────────────────────────────────────────────────────

/// The sync client.
///
/// The cache reader is usable before connecting; everything else needs a
/// live runtime and fails with [`SyncError::Connection`] otherwise.
pub struct SyncClient {
    config: ClientConfig,
    cache: CacheStore,
    state: Arc<RwLock<ConnectionState>>,
    session_id: Option<SessionId>,
    commands: Option<mpsc::Sender<Command>>,
    stop: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            cache: CacheStore::new(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            session_id: None,
            commands: None,
            stop: None,
            tasks: Vec::new(),
        }
    }

    /// Authenticate and start the background tasks.
    pub async fn connect(&mut self, credentials: Credentials) -> Result<SessionId, SyncError> {
        if self.commands.is_some() {
            return Err(SyncError::Connection("already connected".to_string()));
        }
        *self.state.write().await = ConnectionState::Connecting;

        let (ws, session_id) = match handshake(&self.config, &credentials).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        *self.state.write().await = ConnectionState::Connected;
        log::info!("connected to {} as session {session_id}", self.config.server_url);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (input_tx, input_rx) = mpsc::channel(256);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let session = ClientSession::new(
            self.cache.clone(),
            self.config.reconcile.clone(),
            self.config.mutation.clone(),
            self.config.feed.clone(),
        );
        let mut runtime = SessionRuntime::new(session, outbound_tx);
        runtime.handle_input(TransportInput::Connected(session_id));

        let transport = Transport {
            config: self.config.clone(),
            credentials,
            state: self.state.clone(),
            inputs: input_tx,
            outbound: outbound_rx,
            stop: stop_rx,
        };

        self.tasks.push(tokio::spawn(runtime.run(command_rx, input_rx)));
        self.tasks.push(tokio::spawn(transport.run(ws)));
        self.commands = Some(command_tx);
        self.stop = Some(stop_tx);
        self.session_id = Some(session_id);
        Ok(session_id)
    }

    /// Tear down the transport, stop all timers and drop cached state.
    pub async fn disconnect(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Shutdown).await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.cache.clear();
        self.session_id = None;
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("disconnected from {}", self.config.server_url);
    }

    async fn command(&self, cmd: Command) -> Result<(), SyncError> {
        let commands = self.commands.as_ref().ok_or_else(not_connected)?;
        commands.send(cmd).await.map_err(|_| not_connected())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| not_connected())
    }

    /// Join a workspace and wait for the server's admission. Membership is
    /// kept across reconnects until [`leave`](Self::leave).
    pub async fn join(&self, workspace: impl Into<WorkspaceId>) -> Result<(), SyncError> {
        let workspace = workspace.into();
        let (tx, rx) = oneshot::channel();
        self.command(Command::Join(workspace.clone(), tx)).await?;
        rx.await.unwrap_or_else(|_| {
            Err(SyncError::Subscription {
                workspace,
                reason: "join cancelled".to_string(),
            })
        })
    }

    /// Stop routing for `workspace` immediately.
    pub async fn leave(&self, workspace: impl Into<WorkspaceId>) -> Result<(), SyncError> {
        self.command(Command::Leave(workspace.into())).await
    }

    /// Apply `desired` optimistically, send it through `sink`, and wait for
    /// the resolution. Returns the confirmed server state, if one was
    /// reported, or the rollback error.
    pub async fn mutate<S: CommandSink>(
        &self,
        sink: &S,
        resource: impl Into<ResourceId>,
        desired: Value,
    ) -> Result<Option<Value>, SyncError> {
        let resource = resource.into();
        let (ticket, mut outcome) = self
            .request(|reply| Command::BeginMutation {
                resource: resource.clone(),
                desired: desired.clone(),
                reply,
            })
            .await??;

        let command = MutationCommand {
            mutation_id: ticket.id,
            resource_id: resource.clone(),
            desired,
        };
        tokio::select! {
            // An echo can confirm before the command returns.
            resolved = &mut outcome => return finish_mutation(resolved),
            sent = tokio::time::timeout_at(ticket.deadline, sink.send(command)) => match sent {
                Ok(result) => {
                    self.command(Command::ResolveMutation {
                        resource,
                        id: ticket.id,
                        result,
                    })
                    .await?;
                }
                // The runtime's deadline rolls it back.
                Err(_) => log::warn!("no acknowledgment for mutation {} on {resource}", ticket.id),
            },
        }
        finish_mutation(outcome.await)
    }

    /// Read-only cache handle for views.
    pub fn cache(&self) -> CacheReader {
        self.cache.reader()
    }

    /// Newest first.
    pub async fn notifications(&self) -> Result<Vec<Notification>, SyncError> {
        self.request(Command::Notifications).await
    }

    pub async fn dismiss(&self, id: NotificationId) -> Result<bool, SyncError> {
        self.request(|reply| Command::Dismiss(id, reply)).await
    }

    pub async fn mark_all_read(&self) -> Result<(), SyncError> {
        self.command(Command::MarkAllRead).await
    }

    pub async fn subscribe_invalidations(&self) -> Result<Subscription<Invalidation>, SyncError> {
        self.request(Command::SubscribeInvalidations).await
    }

    pub async fn subscribe_outcomes(&self) -> Result<Subscription<MutationOutcome>, SyncError> {
        self.request(Command::SubscribeOutcomes).await
    }

    pub async fn subscribe_connection(&self) -> Result<Subscription<ConnectionEvent>, SyncError> {
        self.request(Command::SubscribeConnection).await
    }

    /// Join rejections, one per attempt.
    pub async fn subscribe_alerts(&self) -> Result<Subscription<SyncError>, SyncError> {
        self.request(Command::SubscribeAlerts).await
    }

    pub async fn unsubscribe(&self, topic: Topic, token: SubscriptionToken) -> Result<(), SyncError> {
        self.command(Command::Unsubscribe(topic, token)).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::optimistic::MutationStatus;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2,
            max_retries: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_client_config_partial_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"server_url":"ws://tracker:9000","reconnect":{"max_retries":3},"reconcile":{"coalesce_window_ms":50}}"#,
        )
        .unwrap();
        assert_eq!(config.server_url, "ws://tracker:9000");
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 200);
        assert_eq!(config.reconcile.coalesce_window_ms, 50);
        assert_eq!(config.mutation.timeout_ms, 10_000);
    }

    #[test]
    fn test_credentials_debug_hides_token() {
        let rendered = format!("{:?}", Credentials::new("s3cret"));
        assert!(!rendered.contains("s3cret"));
    }

    #[tokio::test]
    async fn test_calls_before_connect_fail() {
        let client = SyncClient::new(ClientConfig::default());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(matches!(client.join("P1").await, Err(SyncError::Connection(_))));
        assert!(matches!(client.notifications().await, Err(SyncError::Connection(_))));
        assert!(client.cache().get(&CacheKey::resource(&"I-1".into())).is_none());
    }

    struct Harness {
        commands: mpsc::Sender<Command>,
        inputs: mpsc::Sender<TransportInput>,
        outbound: mpsc::UnboundedReceiver<String>,
        cache: CacheStore,
    }

    fn spawn_runtime() -> Harness {
        let cache = CacheStore::new();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::channel(16);
        let (inputs, input_rx) = mpsc::channel(16);
        let runtime = SessionRuntime::new(ClientSession::with_defaults(cache.clone()), outbound_tx);
        tokio::spawn(runtime.run(command_rx, input_rx));
        Harness {
            commands,
            inputs,
            outbound,
            cache,
        }
    }

    #[tokio::test]
    async fn test_runtime_join_waits_for_admission() {
        let mut h = spawn_runtime();
        h.inputs
            .send(TransportInput::Connected(Uuid::new_v4()))
            .await
            .unwrap();

        let (tx, mut joined) = oneshot::channel();
        h.commands
            .send(Command::Join("P1".into(), tx))
            .await
            .unwrap();
        let sent = h.outbound.recv().await.unwrap();
        assert!(sent.contains("join-workspace"));
        assert!(joined.try_recv().is_err());

        let ack = ControlMessage::WorkspaceJoined {
            workspace_id: "P1".into(),
        }
        .encode()
        .unwrap();
        h.inputs.send(TransportInput::Frame(ack)).await.unwrap();
        assert_eq!(joined.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_runtime_join_rejection_fails_waiter() {
        let h = spawn_runtime();
        h.inputs
            .send(TransportInput::Connected(Uuid::new_v4()))
            .await
            .unwrap();
        let (tx, joined) = oneshot::channel();
        h.commands.send(Command::Join("P2".into(), tx)).await.unwrap();

        let rejection = ControlMessage::WorkspaceJoinRejected {
            workspace_id: "P2".into(),
            reason: "forbidden".into(),
        }
        .encode()
        .unwrap();
        h.inputs.send(TransportInput::Frame(rejection)).await.unwrap();
        assert!(matches!(
            joined.await.unwrap(),
            Err(SyncError::Subscription { .. })
        ));
    }

    #[tokio::test]
    async fn test_runtime_join_after_rejection_is_sent_again() {
        let mut h = spawn_runtime();
        h.inputs
            .send(TransportInput::Connected(Uuid::new_v4()))
            .await
            .unwrap();
        let rejection = ControlMessage::WorkspaceJoinRejected {
            workspace_id: "P2".into(),
            reason: "forbidden".into(),
        }
        .encode()
        .unwrap();

        for _ in 0..2 {
            let (tx, joined) = oneshot::channel();
            h.commands.send(Command::Join("P2".into(), tx)).await.unwrap();
            assert!(h.outbound.recv().await.unwrap().contains("join-workspace"));
            h.inputs
                .send(TransportInput::Frame(rejection.clone()))
                .await
                .unwrap();
            let result = tokio::time::timeout(Duration::from_secs(1), joined)
                .await
                .expect("join settles")
                .unwrap();
            assert!(matches!(result, Err(SyncError::Subscription { .. })));
        }
    }

    #[tokio::test]
    async fn test_runtime_join_fails_fast_once_offline() {
        let mut h = spawn_runtime();
        h.inputs
            .send(TransportInput::Connected(Uuid::new_v4()))
            .await
            .unwrap();
        h.inputs.send(TransportInput::Lost).await.unwrap();
        let gave_up = SyncError::Connection("connection refused".into());
        h.inputs
            .send(TransportInput::Offline(gave_up.clone()))
            .await
            .unwrap();

        let (tx, joined) = oneshot::channel();
        h.commands.send(Command::Join("P1".into(), tx)).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), joined)
            .await
            .expect("join settles")
            .unwrap();
        assert_eq!(result, Err(gave_up));
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_times_out_unacknowledged_mutation() {
        let h = spawn_runtime();
        h.cache
            .put(CacheKey::resource(&"I-7".into()), json!({ "status": "todo" }));

        let (tx, rx) = oneshot::channel();
        h.commands
            .send(Command::BeginMutation {
                resource: "I-7".into(),
                desired: json!({ "status": "in_review" }),
                reply: tx,
            })
            .await
            .unwrap();
        let (_ticket, outcome) = rx.await.unwrap().unwrap();
        assert_eq!(
            h.cache.get(&CacheKey::resource(&"I-7".into())).unwrap()["status"],
            "in_review"
        );

        // Paused clock auto-advances to the mutation deadline.
        let outcome = outcome.await.unwrap();
        assert_eq!(outcome.status(), MutationStatus::RolledBack);
        assert!(matches!(
            outcome.error(),
            Some(SyncError::MutationTimeout { .. })
        ));
        assert_eq!(
            h.cache.get(&CacheKey::resource(&"I-7".into())).unwrap()["status"],
            "todo"
        );
    }

    #[tokio::test]
    async fn test_runtime_rejects_second_mutation_on_pending_resource() {
        let h = spawn_runtime();
        let mut pending = Vec::new();
        for _ in 0..2 {
            let (tx, rx) = oneshot::channel();
            h.commands
                .send(Command::BeginMutation {
                    resource: "I-3".into(),
                    desired: json!({ "status": "done" }),
                    reply: tx,
                })
                .await
                .unwrap();
            pending.push(rx.await.unwrap());
        }
        assert!(pending[0].is_ok());
        assert!(matches!(
            pending[1],
            Err(SyncError::MutationInProgress { .. })
        ));
    }
}
