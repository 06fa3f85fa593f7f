//! Optimistic mutation coordinator.
//!
//! Per resource: `idle → pending → (confirmed | rolled_back) → idle`.
//!
//! Entering `pending` snapshots the displayed state and writes the desired
//! state into the cache. Confirmation applies the server-reported state
//! verbatim (server state wins, no field merge). Rejection or timeout
//! restores the exact snapshot. A second mutation on a pending resource is
//! refused before anything is touched.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::{CacheKey, CacheStore};
use crate::error::SyncError;
use crate::observer::{ObserverRegistry, SubscriptionToken};
use crate::protocol::{DomainEvent, EventKind, ResourceId, SessionId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// No ack or echo within this bound rolls the mutation back
    pub timeout_ms: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl MutationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Confirmed,
    RolledBack,
}

/// State the server reported when confirming.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerState {
    /// Full representation; replaces the optimistic value.
    Reported(Value),
    /// Accepted without a representation; the desired value stays.
    AsDesired,
    /// The resource no longer exists.
    Deleted,
}

#[derive(Debug, Clone)]
struct PendingMutation {
    id: Uuid,
    previous: Option<Value>,
    desired: Value,
    deadline: Instant,
}

/// Returned by [`MutationCoordinator::begin`].
#[derive(Debug, Clone, PartialEq)]
pub struct MutationTicket {
    pub id: Uuid,
    pub resource_id: ResourceId,
    pub deadline: Instant,
}

/// The command sent to the server for one optimistic mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationCommand {
    pub mutation_id: Uuid,
    pub resource_id: ResourceId,
    pub desired: Value,
}

/// External command boundary (REST or RPC).
///
/// `Ok` is the server's acknowledgment. A refusal should come back as
/// [`SyncError::MutationRejected`]; any other error is treated as a
/// rejection with that error's message.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: MutationCommand) -> impl Future<Output = Result<ServerState, SyncError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Confirmed { state: Option<Value> },
    RolledBack { error: SyncError, restored: Option<Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub mutation_id: Uuid,
    pub resource_id: ResourceId,
    pub resolution: Resolution,
}

impl MutationOutcome {
    pub fn status(&self) -> MutationStatus {
        match self.resolution {
            Resolution::Confirmed { .. } => MutationStatus::Confirmed,
            Resolution::RolledBack { .. } => MutationStatus::RolledBack,
        }
    }

    pub fn error(&self) -> Option<&SyncError> {
        match &self.resolution {
            Resolution::RolledBack { error, .. } => Some(error),
            Resolution::Confirmed { .. } => None,
        }
    }
}

pub struct MutationCoordinator {
    config: MutationConfig,
    cache: CacheStore,
    pending: HashMap<ResourceId, PendingMutation>,
    session: Option<SessionId>,
    observers: ObserverRegistry<MutationOutcome>,
}

impl MutationCoordinator {
    pub fn new(config: MutationConfig, cache: CacheStore) -> Self {
        Self {
            config,
            cache,
            pending: HashMap::new(),
            session: None,
            observers: ObserverRegistry::new(),
        }
    }

    /// Receive every confirmed or rolled-back outcome.
    pub fn subscribe(&mut self) -> (SubscriptionToken, mpsc::UnboundedReceiver<MutationOutcome>) {
        self.observers.subscribe()
    }

    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.observers.unsubscribe(token)
    }

    /// Session whose echoes count as confirmations.
    pub fn set_session(&mut self, session: SessionId) {
        self.session = Some(session);
    }

    /// `Pending` while a mutation on `resource` is unresolved, else `Idle`.
    pub fn status(&self, resource: &ResourceId) -> MutationStatus {
        if self.pending.contains_key(resource) {
            MutationStatus::Pending
        } else {
            MutationStatus::Idle
        }
    }

    pub fn is_pending(&self, resource: &ResourceId) -> bool {
        self.pending.contains_key(resource)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot the displayed state, apply `desired` locally, enter `pending`.
    pub fn begin(
        &mut self,
        resource: ResourceId,
        desired: Value,
        now: Instant,
    ) -> Result<MutationTicket, SyncError> {
        if self.pending.contains_key(&resource) {
            return Err(SyncError::MutationInProgress { resource });
        }

        let key = CacheKey::resource(&resource);
        let previous = self.cache.get(&key);
        self.cache.put(key, desired.clone());

        let ticket = MutationTicket {
            id: Uuid::new_v4(),
            resource_id: resource.clone(),
            deadline: now + self.config.timeout(),
        };
        log::debug!("mutation {} on {resource} pending", ticket.id);
        self.pending.insert(
            resource,
            PendingMutation {
                id: ticket.id,
                previous,
                desired,
                deadline: ticket.deadline,
            },
        );
        Ok(ticket)
    }

    /// Explicit success acknowledgment for mutation `id`.
    pub fn confirm(
        &mut self,
        resource: &ResourceId,
        id: Uuid,
        state: ServerState,
    ) -> Option<MutationOutcome> {
        let mutation = self.take_matching(resource, Some(id))?;
        Some(self.apply_confirmation(resource, mutation, state))
    }

    /// Explicit server rejection for mutation `id`.
    pub fn reject(
        &mut self,
        resource: &ResourceId,
        id: Uuid,
        reason: impl Into<String>,
    ) -> Option<MutationOutcome> {
        let mutation = self.take_matching(resource, Some(id))?;
        let error = SyncError::MutationRejected {
            resource: resource.clone(),
            reason: reason.into(),
        };
        Some(self.rollback(resource, mutation, error))
    }

    /// Treat this session's own resource event as confirmation.
    pub fn observe_event(&mut self, event: &DomainEvent) -> Option<MutationOutcome> {
        let session = self.session?;
        if !event.kind.is_resource_change() || !event.is_echo_for(session) {
            return None;
        }
        let resource = event.resource_id();
        let mutation = self.take_matching(resource, None)?;
        let state = match event.kind {
            EventKind::ResourceCreated | EventKind::ResourceUpdated => {
                ServerState::Reported(event.payload.clone())
            }
            EventKind::ResourceDeleted => ServerState::Deleted,
            // Partial payload; the event's invalidation refetches the rest.
            _ => ServerState::AsDesired,
        };
        Some(self.apply_confirmation(resource, mutation, state))
    }

    /// Roll back every mutation whose deadline has passed.
    pub fn expire_due(&mut self, now: Instant) -> Vec<MutationOutcome> {
        let expired: Vec<ResourceId> = self
            .pending
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(resource, _)| resource.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|resource| {
                let mutation = self.pending.remove(&resource)?;
                let error = SyncError::MutationTimeout {
                    resource: resource.clone(),
                };
                Some(self.rollback(&resource, mutation, error))
            })
            .collect()
    }

    /// Earliest deadline among pending mutations.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|m| m.deadline).min()
    }

    fn take_matching(&mut self, resource: &ResourceId, id: Option<Uuid>) -> Option<PendingMutation> {
        let current = self.pending.get(resource)?.id;
        if let Some(id) = id.filter(|id| *id != current) {
            log::debug!("ignoring resolution of superseded mutation {id} on {resource}");
            return None;
        }
        self.pending.remove(resource)
    }

    fn apply_confirmation(
        &mut self,
        resource: &ResourceId,
        mutation: PendingMutation,
        state: ServerState,
    ) -> MutationOutcome {
        let key = CacheKey::resource(resource);
        let state = match state {
            ServerState::Reported(value) => {
                if value != mutation.desired {
                    log::info!("{resource}: server state differs from optimistic state; server wins");
                }
                self.cache.put(key, value.clone());
                Some(value)
            }
            ServerState::AsDesired => Some(mutation.desired),
            ServerState::Deleted => {
                self.cache.remove(&key);
                None
            }
        };
        log::debug!("mutation {} on {resource} confirmed", mutation.id);
        self.emit(MutationOutcome {
            mutation_id: mutation.id,
            resource_id: resource.clone(),
            resolution: Resolution::Confirmed { state },
        })
    }

    fn rollback(
        &mut self,
        resource: &ResourceId,
        mutation: PendingMutation,
        error: SyncError,
    ) -> MutationOutcome {
        let key = CacheKey::resource(resource);
        match &mutation.previous {
            Some(previous) => self.cache.put(key, previous.clone()),
            None => {
                self.cache.remove(&key);
            }
        }
        log::warn!("mutation {} rolled back: {error}", mutation.id);
        self.emit(MutationOutcome {
            mutation_id: mutation.id,
            resource_id: resource.clone(),
            resolution: Resolution::RolledBack {
                error,
                restored: mutation.previous,
            },
        })
    }

    fn emit(&mut self, outcome: MutationOutcome) -> MutationOutcome {
        self.observers.notify(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Scope;
    use serde_json::json;

    fn setup() -> (MutationCoordinator, CacheStore, ResourceId, CacheKey) {
        let cache = CacheStore::new();
        let resource = ResourceId::new("I-7");
        let key = CacheKey::resource(&resource);
        cache.put(key.clone(), json!({ "id": "I-7", "status": "todo", "title": "Fix login" }));
        (
            MutationCoordinator::new(MutationConfig::default(), cache.clone()),
            cache,
            resource,
            key,
        )
    }

    fn s1() -> Value {
        json!({ "id": "I-7", "status": "in_review", "title": "Fix login" })
    }

    #[test]
    fn test_confirmed_round_trip_ends_at_desired_state() {
        let (mut coordinator, cache, resource, key) = setup();
        let ticket = coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();
        assert_eq!(cache.get(&key), Some(s1()));
        assert_eq!(coordinator.status(&resource), MutationStatus::Pending);

        let outcome = coordinator
            .confirm(&resource, ticket.id, ServerState::Reported(s1()))
            .unwrap();
        assert_eq!(outcome.status(), MutationStatus::Confirmed);
        assert_eq!(cache.get(&key), Some(s1()));
        assert_eq!(coordinator.status(&resource), MutationStatus::Idle);
    }

    #[test]
    fn test_server_state_wins_over_desired() {
        let (mut coordinator, cache, resource, key) = setup();
        let ticket = coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();

        let server = json!({ "id": "I-7", "status": "done", "title": "Fix login (renamed)" });
        coordinator.confirm(&resource, ticket.id, ServerState::Reported(server.clone()));
        assert_eq!(cache.get(&key), Some(server));
    }

    #[test]
    fn test_rejection_restores_exact_snapshot() {
        let (mut coordinator, cache, resource, key) = setup();
        let s0 = cache.get(&key);
        let ticket = coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();

        let outcome = coordinator.reject(&resource, ticket.id, "conflict").unwrap();
        assert_eq!(cache.get(&key), s0);
        assert_eq!(
            outcome.error(),
            Some(&SyncError::MutationRejected {
                resource: resource.clone(),
                reason: "conflict".into()
            })
        );
        assert_eq!(coordinator.status(&resource), MutationStatus::Idle);
    }

    #[test]
    fn test_timeout_rolls_back() {
        let (mut coordinator, cache, resource, key) = setup();
        let s0 = cache.get(&key);
        let start = Instant::now();
        coordinator.begin(resource.clone(), s1(), start).unwrap();

        assert!(coordinator.expire_due(start + Duration::from_secs(9)).is_empty());
        assert_eq!(coordinator.next_deadline(), Some(start + Duration::from_secs(10)));

        let outcomes = coordinator.expire_due(start + Duration::from_secs(10));
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0].error(),
            Some(SyncError::MutationTimeout { .. })
        ));
        assert_eq!(cache.get(&key), s0);
    }

    #[test]
    fn test_second_mutation_rejected_without_state_change() {
        let (mut coordinator, cache, resource, key) = setup();
        let first = coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();

        let err = coordinator
            .begin(resource.clone(), json!({ "status": "done" }), Instant::now())
            .unwrap_err();
        assert_eq!(err, SyncError::MutationInProgress { resource: resource.clone() });
        assert_eq!(cache.get(&key), Some(s1()));

        // The original mutation still resolves back to the true snapshot.
        coordinator.reject(&resource, first.id, "nope");
        assert_eq!(cache.get(&key).unwrap()["status"], "todo");
    }

    #[test]
    fn test_rollback_without_snapshot_clears_entry() {
        let cache = CacheStore::new();
        let mut coordinator = MutationCoordinator::new(MutationConfig::default(), cache.clone());
        let resource = ResourceId::new("I-new");
        let ticket = coordinator.begin(resource.clone(), json!({ "title": "draft" }), Instant::now()).unwrap();

        coordinator.reject(&resource, ticket.id, "invalid");
        assert_eq!(cache.get(&CacheKey::resource(&resource)), None);
    }

    #[test]
    fn test_stale_ack_does_not_resolve_newer_mutation() {
        let (mut coordinator, _, resource, _) = setup();
        let first = coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();
        coordinator.reject(&resource, first.id, "conflict");
        coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();

        assert!(coordinator.confirm(&resource, first.id, ServerState::AsDesired).is_none());
        assert!(coordinator.is_pending(&resource));
    }

    #[test]
    fn test_own_echo_confirms() {
        let (mut coordinator, cache, resource, key) = setup();
        let me = Uuid::new_v4();
        coordinator.set_session(me);
        coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();

        let echo = DomainEvent::new(
            EventKind::ResourceUpdated,
            Scope::new("P1", "I-7"),
            s1(),
        )
        .with_origin(me);
        let outcome = coordinator.observe_event(&echo).unwrap();
        assert_eq!(outcome.status(), MutationStatus::Confirmed);
        assert_eq!(cache.get(&key), Some(s1()));
    }

    #[test]
    fn test_foreign_or_child_events_do_not_confirm() {
        let (mut coordinator, _, resource, _) = setup();
        let me = Uuid::new_v4();
        coordinator.set_session(me);
        coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();

        let foreign = DomainEvent::new(EventKind::ResourceUpdated, Scope::new("P1", "I-7"), s1())
            .with_origin(Uuid::new_v4());
        assert!(coordinator.observe_event(&foreign).is_none());

        let comment = DomainEvent::new(
            EventKind::CommentCreated,
            Scope::new("P1", "I-7"),
            json!({ "resourceId": "I-7" }),
        )
        .with_origin(me);
        assert!(coordinator.observe_event(&comment).is_none());
        assert!(coordinator.is_pending(&resource));
    }

    #[test]
    fn test_outcomes_are_observable() {
        let (mut coordinator, _, resource, _) = setup();
        let (_token, mut rx) = coordinator.subscribe();
        let ticket = coordinator.begin(resource.clone(), s1(), Instant::now()).unwrap();
        coordinator.confirm(&resource, ticket.id, ServerState::AsDesired);

        let outcome = rx.try_recv().unwrap();
        assert_eq!(outcome.mutation_id, ticket.id);
        assert_eq!(
            outcome.resolution,
            Resolution::Confirmed { state: Some(s1()) }
        );
    }
}
