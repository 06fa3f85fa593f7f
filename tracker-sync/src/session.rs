//! Per-session client state, driven by one sequential event stream.
//!
//! `ClientSession` owns the subscription registry, reconciliation engine,
//! mutation coordinator and notification feed. It does no I/O: callers feed
//! it frames, commands and clock ticks, and send whatever control messages
//! it returns. Only one task ever holds it, so none of its state is locked.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::{CacheReader, CacheStore};
use crate::error::SyncError;
use crate::feed::{FeedConfig, NotificationFeed};
use crate::observer::{ObserverRegistry, SubscriptionToken};
use crate::optimistic::{
    MutationConfig, MutationCoordinator, MutationOutcome, MutationTicket, ServerState,
};
use crate::protocol::{
    ControlMessage, DomainEvent, Frame, ProtocolError, ResourceId, SessionId, WorkspaceId,
};
use crate::reconcile::{Invalidation, ReconcileConfig, ReconciliationEngine};
use crate::subscriptions::SubscriptionRegistry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub events_delivered: u64,
    /// Events for workspaces this session is not subscribed to
    pub events_out_of_scope: u64,
    /// Unknown types and malformed payloads
    pub frames_dropped: u64,
}

/// Work produced by one [`ClientSession::tick`].
#[derive(Debug, Default)]
pub struct TickReport {
    pub invalidations: Vec<Invalidation>,
    pub rolled_back: Vec<MutationOutcome>,
}

pub struct ClientSession {
    session_id: Option<SessionId>,
    cache: CacheStore,
    subscriptions: SubscriptionRegistry,
    engine: ReconciliationEngine,
    mutations: MutationCoordinator,
    feed: NotificationFeed,
    alerts: ObserverRegistry<SyncError>,
    stats: SessionStats,
}

impl ClientSession {
    pub fn new(
        cache: CacheStore,
        reconcile: ReconcileConfig,
        mutation: MutationConfig,
        feed: FeedConfig,
    ) -> Self {
        Self {
            session_id: None,
            engine: ReconciliationEngine::new(reconcile, cache.clone()),
            mutations: MutationCoordinator::new(mutation, cache.clone()),
            cache,
            subscriptions: SubscriptionRegistry::new(),
            feed: NotificationFeed::new(feed),
            alerts: ObserverRegistry::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn with_defaults(cache: CacheStore) -> Self {
        Self::new(
            cache,
            ReconcileConfig::default(),
            MutationConfig::default(),
            FeedConfig::default(),
        )
    }

    // ── transport lifecycle ───────────────────────────────────────────

    /// Transport (re)established. Returns the joins to re-issue.
    pub fn on_connected(&mut self, session_id: SessionId) -> Vec<ControlMessage> {
        self.session_id = Some(session_id);
        self.mutations.set_session(session_id);
        let joins = self.subscriptions.on_connected();
        if !joins.is_empty() {
            log::info!("restoring {} workspace subscription(s)", joins.len());
        }
        joins
    }

    /// Transport lost: suspend delivery, keep membership, and fire pending
    /// invalidations now so no timer outlives the connection.
    ///
    /// In-flight mutations stay pending. No echo can confirm them while
    /// suspended, so they resolve by an explicit ack or by their deadline,
    /// which keeps running offline.
    pub fn on_connection_lost(&mut self) -> Vec<Invalidation> {
        self.subscriptions.suspend();
        let in_flight = self.mutations.pending_count();
        if in_flight > 0 {
            log::info!("{in_flight} mutation(s) in flight while offline");
        }
        self.engine.flush_all()
    }

    /// Teardown: release every timer and forget derived state.
    pub fn shutdown(&mut self) {
        self.subscriptions.suspend();
        self.engine.clear();
    }

    // ── membership ────────────────────────────────────────────────────

    pub fn join(&mut self, workspace: WorkspaceId) -> Option<ControlMessage> {
        self.subscriptions.join(workspace)
    }

    pub fn leave(&mut self, workspace: &WorkspaceId) -> Option<ControlMessage> {
        self.subscriptions.leave(workspace)
    }

    // ── inbound ───────────────────────────────────────────────────────

    /// Decode and route one text frame. Undecodable frames are dropped.
    pub fn handle_text(&mut self, text: &str, now: Instant) {
        match Frame::decode(text) {
            Ok(Frame::Control(msg)) => self.handle_control(msg),
            Ok(Frame::Event(event)) => {
                self.handle_event(event, now);
            }
            Err(e) => {
                self.stats.frames_dropped += 1;
                match e {
                    ProtocolError::Malformed { .. } => {
                        log::warn!("dropping {}", SyncError::MalformedEvent(e.to_string()));
                    }
                    e if e.is_droppable() => log::warn!("dropping frame: {e}"),
                    e => log::error!("unreadable frame: {e}"),
                }
            }
        }
    }

    pub fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::WorkspaceJoined { workspace_id } => {
                if self.subscriptions.on_joined(&workspace_id) {
                    log::info!("joined workspace {workspace_id}");
                }
            }
            ControlMessage::WorkspaceJoinRejected {
                workspace_id,
                reason,
            } => {
                let error = self.subscriptions.on_join_rejected(&workspace_id, &reason);
                log::warn!("{error}");
                self.alerts.notify(&error);
            }
            ControlMessage::WorkspaceLeft { workspace_id } => {
                self.subscriptions.on_left(&workspace_id);
            }
            ControlMessage::Pong => log::trace!("pong"),
            other => log::debug!("ignoring control message {other:?}"),
        }
    }

    /// Route one domain event. Returns whether it was in scope.
    pub fn handle_event(&mut self, event: DomainEvent, now: Instant) -> bool {
        if !self.subscriptions.accepts(event.workspace_id()) {
            self.stats.events_out_of_scope += 1;
            log::debug!(
                "dropping {} for unsubscribed workspace {}",
                event.kind,
                event.workspace_id()
            );
            return false;
        }
        self.stats.events_delivered += 1;

        let resolved = self.mutations.observe_event(&event).is_some();
        let pending = self.mutations.is_pending(event.resource_id());
        self.engine.ingest(&event, pending, now);
        if resolved {
            self.engine.release(event.resource_id(), now);
        }
        self.feed.push(&event);
        true
    }

    // ── optimistic mutations ──────────────────────────────────────────

    pub fn begin_mutation(
        &mut self,
        resource: ResourceId,
        desired: Value,
        now: Instant,
    ) -> Result<MutationTicket, SyncError> {
        let ticket = self.mutations.begin(resource, desired, now)?;
        self.engine.defer_scheduled(&ticket.resource_id, now);
        Ok(ticket)
    }

    pub fn confirm_mutation(
        &mut self,
        resource: &ResourceId,
        id: Uuid,
        state: ServerState,
        now: Instant,
    ) -> Option<MutationOutcome> {
        let outcome = self.mutations.confirm(resource, id, state)?;
        self.engine.release(resource, now);
        Some(outcome)
    }

    pub fn reject_mutation(
        &mut self,
        resource: &ResourceId,
        id: Uuid,
        reason: &str,
        now: Instant,
    ) -> Option<MutationOutcome> {
        let outcome = self.mutations.reject(resource, id, reason)?;
        self.after_rollback(&outcome, now);
        Some(outcome)
    }

    // ── clock ─────────────────────────────────────────────────────────

    /// Expire overdue mutations, then fire due invalidations.
    pub fn tick(&mut self, now: Instant) -> TickReport {
        let rolled_back = self.mutations.expire_due(now);
        for outcome in &rolled_back {
            self.after_rollback(outcome, now);
        }
        TickReport {
            invalidations: self.engine.flush_due(now),
            rolled_back,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.engine.next_deadline(), self.mutations.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn after_rollback(&mut self, outcome: &MutationOutcome, now: Instant) {
        self.engine.release(&outcome.resource_id, now);
        if let Some(error) = outcome.error() {
            self.feed.push_mutation_failure(&outcome.resource_id, error);
        }
    }

    // ── observers and accessors ───────────────────────────────────────

    pub fn subscribe_invalidations(
        &mut self,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<Invalidation>) {
        self.engine.subscribe()
    }

    pub fn unsubscribe_invalidations(&mut self, token: SubscriptionToken) -> bool {
        self.engine.unsubscribe(token)
    }

    pub fn subscribe_outcomes(
        &mut self,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<MutationOutcome>) {
        self.mutations.subscribe()
    }

    pub fn unsubscribe_outcomes(&mut self, token: SubscriptionToken) -> bool {
        self.mutations.unsubscribe(token)
    }

    /// Subscription errors, surfaced once per rejected join.
    pub fn subscribe_alerts(&mut self) -> (SubscriptionToken, mpsc::UnboundedReceiver<SyncError>) {
        self.alerts.subscribe()
    }

    pub fn unsubscribe_alerts(&mut self, token: SubscriptionToken) -> bool {
        self.alerts.unsubscribe(token)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn cache(&self) -> CacheReader {
        self.cache.reader()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.mutations
    }

    pub fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    pub fn feed_mut(&mut self) -> &mut NotificationFeed {
        &mut self.feed
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}
