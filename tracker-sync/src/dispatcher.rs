//! Server-side event dispatch.
//!
//! The persistence layer calls [`EventDispatcher::dispatch`] once per
//! committed change. The dispatcher builds one [`DomainEvent`], encodes it
//! once and publishes it to the workspace room only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::broadcast::{SharedFrame, WorkspaceRooms};
use crate::protocol::{DomainEvent, EventKind, ProtocolError, Scope, SessionId};

/// A change that has been durably committed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedChange {
    pub kind: EventKind,
    pub scope: Scope,
    pub payload: Value,
    /// Session whose command caused the change, if any.
    pub actor: Option<SessionId>,
}

impl CommittedChange {
    pub fn new(kind: EventKind, scope: Scope, payload: Value) -> Self {
        Self {
            kind,
            scope,
            payload,
            actor: None,
        }
    }

    pub fn by(mut self, actor: SessionId) -> Self {
        self.actor = Some(actor);
        self
    }

    fn into_event(self) -> DomainEvent {
        let event = DomainEvent::new(self.kind, self.scope, self.payload);
        match self.actor {
            Some(actor) => event.with_origin(actor),
            None => event,
        }
    }
}

/// Cheap clone handle over the server's rooms.
#[derive(Clone)]
pub struct EventDispatcher {
    rooms: Arc<WorkspaceRooms>,
    dispatched: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new(rooms: Arc<WorkspaceRooms>) -> Self {
        Self {
            rooms,
            dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Broadcast one committed change. Returns the number of sessions
    /// subscribed to its workspace at dispatch time.
    pub async fn dispatch(&self, change: CommittedChange) -> Result<usize, ProtocolError> {
        let event = change.into_event();
        let frame: SharedFrame = Arc::from(event.encode()?);
        let reached = self.rooms.publish(event.workspace_id(), frame).await;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "dispatched {} for {}/{} to {reached} session(s)",
            event.kind,
            event.workspace_id(),
            event.resource_id()
        );
        Ok(reached)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}
