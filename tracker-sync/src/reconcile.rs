//! Client reconciliation engine: domain events → cache invalidations.
//!
//! ```text
//! DomainEvent ──► key_patterns(kind) ──► affected CacheKeys
//!                                             │
//!                     resource has pending mutation?
//!                      │ yes                        │ no
//!                      ▼                            ▼
//!               deferred batch              DebounceQueue (trailing edge)
//!          (released on resolve, or               │
//!           forced after deferral_timeout)        ▼
//!                      └──────────────► CacheStore::invalidate + Invalidation signal
//! ```
//!
//! Invalidated keys are not refetched here; views refetch on next read.
//! All deadlines are owned by the engine and driven by the caller's clock,
//! so the session loop decides when to wake up via [`next_deadline`].
//!
//! [`next_deadline`]: ReconciliationEngine::next_deadline

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::{CacheKey, CacheStore, KeyKind};
use crate::observer::{ObserverRegistry, SubscriptionToken};
use crate::protocol::{DomainEvent, EventKind, ResourceId};

/// Reconciliation timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Coalescing window per cache key
    pub coalesce_window_ms: u64,
    /// Upper bound on holding events for a resource with a pending mutation
    pub deferral_timeout_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 100,
            deferral_timeout_ms: 3_000,
        }
    }
}

impl ReconcileConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn deferral_timeout(&self) -> Duration {
        Duration::from_millis(self.deferral_timeout_ms)
    }
}

/// Trailing-edge debounce: each touch pushes the key's deadline out by one
/// window; a key fires once its deadline passes with no further touches.
#[derive(Debug)]
pub struct DebounceQueue<K> {
    window: Duration,
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> DebounceQueue<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadlines: HashMap::new(),
        }
    }

    /// Schedule or extend `key`. Returns `true` if it was not yet scheduled.
    pub fn touch(&mut self, key: K, now: Instant) -> bool {
        self.deadlines.insert(key, now + self.window).is_none()
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key whose deadline has passed.
    pub fn drain_due(&mut self, now: Instant) -> Vec<K> {
        let due: Vec<K> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.deadlines.remove(key);
        }
        due
    }

    /// Remove and return every scheduled key matching `pred`.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> Vec<K> {
        let matched: Vec<K> = self.deadlines.keys().filter(|k| pred(k)).cloned().collect();
        for key in &matched {
            self.deadlines.remove(key);
        }
        matched
    }

    /// Remove every scheduled key regardless of deadline.
    pub fn drain_all(&mut self) -> Vec<K> {
        self.deadlines.drain().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

/// Families of cache keys an event can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPattern {
    /// `resource:<resourceId>`
    Resource,
    /// every `resource-list:<workspaceId>[?params]`
    ResourceLists,
    /// every `comment-list:<resourceId>[?params]`
    CommentLists,
    /// every `worklog-list:<resourceId>[?params]`
    WorklogLists,
}

/// Static event-type → key-pattern table.
pub fn key_patterns(kind: EventKind) -> &'static [KeyPattern] {
    use KeyPattern as P;
    match kind {
        EventKind::ResourceCreated
        | EventKind::ResourceUpdated
        | EventKind::ResourceStatusChanged => &[P::Resource, P::ResourceLists],
        EventKind::ResourceDeleted => &[
            P::Resource,
            P::ResourceLists,
            P::CommentLists,
            P::WorklogLists,
        ],
        // Comment and worklog counts/time spent live on the resource too.
        EventKind::CommentCreated | EventKind::CommentUpdated | EventKind::CommentDeleted => {
            &[P::CommentLists, P::Resource]
        }
        EventKind::WorklogCreated | EventKind::WorklogUpdated | EventKind::WorklogDeleted => {
            &[P::WorklogLists, P::Resource]
        }
    }
}

/// Signal that a cache key was invalidated.
#[derive(Debug, Clone, PartialEq)]
pub struct Invalidation {
    pub key: CacheKey,
    /// Whether a value was cached when it went stale
    pub had_value: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileStats {
    pub events: u64,
    pub deferred_events: u64,
    pub forced_releases: u64,
    pub invalidations: u64,
}

#[derive(Debug)]
struct DeferredBatch {
    keys: BTreeSet<CacheKey>,
    force_at: Instant,
}

pub struct ReconciliationEngine {
    config: ReconcileConfig,
    cache: CacheStore,
    debounce: DebounceQueue<CacheKey>,
    deferred: HashMap<ResourceId, DeferredBatch>,
    observers: ObserverRegistry<Invalidation>,
    stats: ReconcileStats,
}

impl ReconciliationEngine {
    pub fn new(config: ReconcileConfig, cache: CacheStore) -> Self {
        let debounce = DebounceQueue::new(config.coalesce_window());
        Self {
            config,
            cache,
            debounce,
            deferred: HashMap::new(),
            observers: ObserverRegistry::new(),
            stats: ReconcileStats::default(),
        }
    }

    pub fn subscribe(&mut self) -> (SubscriptionToken, mpsc::UnboundedReceiver<Invalidation>) {
        self.observers.subscribe()
    }

    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        self.observers.unsubscribe(token)
    }

    /// Concrete keys affected by `event`: the bare key of each pattern plus
    /// every cached variant with list parameters.
    pub fn affected_keys(&self, event: &DomainEvent) -> BTreeSet<CacheKey> {
        let resource = event.resource_id();
        let mut keys = BTreeSet::new();
        for pattern in key_patterns(event.kind) {
            let (kind, id) = match pattern {
                KeyPattern::Resource => {
                    keys.insert(CacheKey::resource(resource));
                    continue;
                }
                KeyPattern::ResourceLists => (KeyKind::ResourceList, event.workspace_id().as_str()),
                KeyPattern::CommentLists => (KeyKind::CommentList, resource.as_str()),
                KeyPattern::WorklogLists => (KeyKind::WorklogList, resource.as_str()),
            };
            keys.insert(CacheKey::new(kind, id));
            keys.extend(self.cache.keys_matching(kind, id));
        }
        keys
    }

    /// Schedule invalidations for `event`. When the resource has a pending
    /// mutation the keys are held until [`release`](Self::release) or the
    /// deferral timeout. Returns the number of keys affected.
    pub fn ingest(&mut self, event: &DomainEvent, resource_pending: bool, now: Instant) -> usize {
        self.stats.events += 1;
        let keys = self.affected_keys(event);
        let count = keys.len();

        if resource_pending {
            self.stats.deferred_events += 1;
            let force_at = now + self.config.deferral_timeout();
            let batch = self
                .deferred
                .entry(event.resource_id().clone())
                .or_insert_with(|| DeferredBatch {
                    keys: BTreeSet::new(),
                    force_at,
                });
            batch.keys.extend(keys);
            log::debug!(
                "deferring {} for {} (mutation pending)",
                event.kind,
                event.resource_id()
            );
            return count;
        }

        for key in keys {
            self.debounce.touch(key, now);
        }
        count
    }

    /// A mutation on `resource` began: keys of that resource already waiting
    /// in the debounce queue move to its deferred batch. Workspace list keys
    /// are shared with other resources and stay scheduled.
    pub fn defer_scheduled(&mut self, resource: &ResourceId, now: Instant) -> usize {
        let keys = self.debounce.drain_where(|key| {
            key.kind != KeyKind::ResourceList && key.id == resource.as_str()
        });
        if keys.is_empty() {
            return 0;
        }
        let count = keys.len();
        let force_at = now + self.config.deferral_timeout();
        self.deferred
            .entry(resource.clone())
            .or_insert_with(|| DeferredBatch {
                keys: BTreeSet::new(),
                force_at,
            })
            .keys
            .extend(keys);
        log::debug!("holding {count} scheduled key(s) for {resource} (mutation began)");
        count
    }

    /// A mutation on `resource` resolved: its held keys join the debounce queue.
    pub fn release(&mut self, resource: &ResourceId, now: Instant) -> usize {
        let Some(batch) = self.deferred.remove(resource) else {
            return 0;
        };
        let count = batch.keys.len();
        for key in batch.keys {
            self.debounce.touch(key, now);
        }
        count
    }

    /// Fire every due invalidation, including deferred batches past their
    /// forced-release deadline.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Invalidation> {
        let mut due: BTreeSet<CacheKey> = self.debounce.drain_due(now).into_iter().collect();

        let forced: Vec<ResourceId> = self
            .deferred
            .iter()
            .filter(|(_, batch)| batch.force_at <= now)
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in forced {
            if let Some(batch) = self.deferred.remove(&resource) {
                log::warn!("forcing invalidation for {resource}: mutation still unresolved");
                self.stats.forced_releases += 1;
                for key in batch.keys {
                    self.debounce.cancel(&key);
                    due.insert(key);
                }
            }
        }

        self.invalidate_all(due)
    }

    /// Transport lost: fire everything scheduled now and release all timers.
    pub fn flush_all(&mut self) -> Vec<Invalidation> {
        let mut keys: BTreeSet<CacheKey> = self.debounce.drain_all().into_iter().collect();
        for (_, batch) in self.deferred.drain() {
            keys.extend(batch.keys);
        }
        self.invalidate_all(keys)
    }

    /// Teardown: drop every timer without invalidating.
    pub fn clear(&mut self) {
        self.debounce.drain_all();
        self.deferred.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let forced = self.deferred.values().map(|b| b.force_at).min();
        match (self.debounce.next_deadline(), forced) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_deferred(&self, resource: &ResourceId) -> bool {
        self.deferred.contains_key(resource)
    }

    pub fn scheduled(&self) -> usize {
        self.debounce.len()
    }

    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    fn invalidate_all(&mut self, keys: BTreeSet<CacheKey>) -> Vec<Invalidation> {
        keys.into_iter()
            .map(|key| {
                let had_value = self.cache.invalidate(&key);
                log::trace!("invalidated {key}");
                let signal = Invalidation { key, had_value };
                self.observers.notify(&signal);
                self.stats.invalidations += 1;
                signal
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Scope;
    use serde_json::json;

    const WINDOW: Duration = Duration::from_millis(100);

    fn engine() -> (ReconciliationEngine, CacheStore) {
        let cache = CacheStore::new();
        (
            ReconciliationEngine::new(ReconcileConfig::default(), cache.clone()),
            cache,
        )
    }

    fn status_changed(ws: &str, id: &str) -> DomainEvent {
        DomainEvent::new(
            EventKind::ResourceStatusChanged,
            Scope::new(ws, id),
            json!({ "status": "done" }),
        )
    }

    fn keys(invalidations: &[Invalidation]) -> Vec<String> {
        invalidations.iter().map(|i| i.key.to_string()).collect()
    }

    #[test]
    fn test_debounce_extends_window() {
        let start = Instant::now();
        let mut queue = DebounceQueue::new(WINDOW);
        assert!(queue.touch("k", start));
        assert!(!queue.touch("k", start + Duration::from_millis(80)));

        assert!(queue.drain_due(start + Duration::from_millis(120)).is_empty());
        assert_eq!(queue.drain_due(start + Duration::from_millis(180)), vec!["k"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_status_change_invalidates_resource_and_list() {
        let (mut engine, _) = engine();
        let now = Instant::now();
        engine.ingest(&status_changed("P1", "I-42"), false, now);

        assert!(engine.flush_due(now).is_empty());
        let fired = engine.flush_due(now + WINDOW);
        assert_eq!(keys(&fired), vec!["resource:I-42", "resource-list:P1"]);
    }

    #[test]
    fn test_list_variants_with_params_are_invalidated() {
        let (mut engine, cache) = engine();
        let p1 = "P1".into();
        cache.put(CacheKey::resource_list(&p1).with_params("status=open"), json!([]));
        cache.put(CacheKey::resource_list(&"P2".into()), json!([]));

        let affected = engine.affected_keys(&status_changed("P1", "I-1"));
        let names: Vec<String> = affected.iter().map(ToString::to_string).collect();
        assert!(names.contains(&"resource-list:P1?status=open".to_string()));
        assert!(!names.iter().any(|k| k.contains("P2")));
    }

    #[test]
    fn test_burst_coalesces_to_single_invalidation() {
        let (mut engine, cache) = engine();
        let key = CacheKey::resource(&"I-42".into());
        cache.put(key.clone(), json!({ "status": "todo" }));
        let (_token, mut rx) = engine.subscribe();

        let start = Instant::now();
        for i in 0..10 {
            engine.ingest(&status_changed("P1", "I-42"), false, start + Duration::from_millis(i * 20));
        }
        assert!(engine.flush_due(start + Duration::from_millis(250)).is_empty());

        let fired = engine.flush_due(start + Duration::from_millis(280));
        assert_eq!(fired.iter().filter(|i| i.key == key).count(), 1);
        assert!(cache.is_stale(&key));

        let mut signals = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            signals.push(signal);
        }
        assert_eq!(signals.iter().filter(|i| i.key == key).count(), 1);
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn test_comment_events_touch_comment_list_and_resource() {
        let (engine, _) = engine();
        let event = DomainEvent::new(
            EventKind::CommentDeleted,
            Scope::new("P1", "I-3"),
            json!({ "commentId": "C-1", "resourceId": "I-3" }),
        );
        let names: Vec<String> = engine.affected_keys(&event).iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["resource:I-3", "comment-list:I-3"]);
    }

    #[test]
    fn test_deleted_resource_drops_child_lists() {
        let (engine, _) = engine();
        let event = DomainEvent::new(
            EventKind::ResourceDeleted,
            Scope::new("P1", "I-3"),
            json!({ "resourceId": "I-3", "workspaceId": "P1" }),
        );
        assert_eq!(engine.affected_keys(&event).len(), 4);
    }

    #[test]
    fn test_pending_resource_events_are_deferred_until_release() {
        let (mut engine, _) = engine();
        let now = Instant::now();
        engine.ingest(&status_changed("P1", "I-7"), true, now);

        assert!(engine.is_deferred(&"I-7".into()));
        assert!(engine.flush_due(now + Duration::from_secs(1)).is_empty());

        let released_at = now + Duration::from_secs(1);
        assert_eq!(engine.release(&"I-7".into(), released_at), 2);
        let fired = engine.flush_due(released_at + WINDOW);
        assert_eq!(keys(&fired), vec!["resource:I-7", "resource-list:P1"]);
    }

    #[test]
    fn test_scheduled_keys_are_held_once_mutation_begins() {
        let (mut engine, _) = engine();
        let now = Instant::now();
        engine.ingest(&status_changed("P1", "I-7"), false, now);

        let began = now + Duration::from_millis(50);
        assert_eq!(engine.defer_scheduled(&"I-7".into(), began), 1);
        assert!(engine.is_deferred(&"I-7".into()));
        assert_eq!(engine.defer_scheduled(&"I-8".into(), began), 0);

        let fired = engine.flush_due(now + WINDOW + Duration::from_millis(50));
        assert_eq!(keys(&fired), vec!["resource-list:P1"]);

        engine.release(&"I-7".into(), began + WINDOW);
        let fired = engine.flush_due(began + WINDOW + WINDOW);
        assert_eq!(keys(&fired), vec!["resource:I-7"]);
    }

    #[test]
    fn test_deferral_timeout_forces_invalidation() {
        let (mut engine, _) = engine();
        let now = Instant::now();
        engine.ingest(&status_changed("P1", "I-7"), true, now);

        let deadline = now + Duration::from_millis(3_000);
        assert_eq!(engine.next_deadline(), Some(deadline));
        let fired = engine.flush_due(deadline);
        assert_eq!(fired.len(), 2);
        assert!(!engine.is_deferred(&"I-7".into()));
        assert_eq!(engine.stats().forced_releases, 1);
    }

    #[test]
    fn test_flush_all_releases_every_timer() {
        let (mut engine, _) = engine();
        let now = Instant::now();
        engine.ingest(&status_changed("P1", "I-1"), false, now);
        engine.ingest(&status_changed("P1", "I-2"), true, now);

        let fired = engine.flush_all();
        assert_eq!(fired.len(), 3);
        assert!(engine.next_deadline().is_none());
    }

    #[test]
    fn test_clear_drops_without_invalidating() {
        let (mut engine, cache) = engine();
        let key = CacheKey::resource(&"I-1".into());
        cache.put(key.clone(), json!({}));
        engine.ingest(&status_changed("P1", "I-1"), false, Instant::now());

        engine.clear();
        assert_eq!(engine.scheduled(), 0);
        assert!(!cache.is_stale(&key));
    }
}
