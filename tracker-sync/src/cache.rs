//! Client-held derived state, keyed by composite cache keys.
//!
//! Only the reconciliation engine and the mutation coordinator write to the
//! store. Views hold a [`CacheReader`] and refetch lazily (cache-aside) when
//! an entry is missing or stale.
//!
//! Every write bumps a per-key generation. A refetch started before an
//! invalidation or optimistic write lands as stale instead of fresh, so it
//! cannot hide a newer change.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::SyncError;
use crate::protocol::{ResourceId, WorkspaceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyKind {
    Resource,
    ResourceList,
    CommentList,
    WorklogList,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::ResourceList => "resource-list",
            Self::CommentList => "comment-list",
            Self::WorklogList => "worklog-list",
        }
    }
}

/// `(kind, id, optional list-scope parameters)`, printed as
/// `resource-list:P1?status=open`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub kind: KeyKind,
    pub id: String,
    pub params: Option<String>,
}

impl CacheKey {
    pub fn new(kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            params: None,
        }
    }

    pub fn resource(id: &ResourceId) -> Self {
        Self::new(KeyKind::Resource, id.as_str())
    }

    pub fn resource_list(workspace: &WorkspaceId) -> Self {
        Self::new(KeyKind::ResourceList, workspace.as_str())
    }

    pub fn comments(resource: &ResourceId) -> Self {
        Self::new(KeyKind::CommentList, resource.as_str())
    }

    pub fn worklogs(resource: &ResourceId) -> Self {
        Self::new(KeyKind::WorklogList, resource.as_str())
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = Some(params.into());
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)?;
        if let Some(params) = &self.params {
            write!(f, "?{params}")?;
        }
        Ok(())
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Value),
    Stale(Value),
    Missing,
}

#[derive(Debug, Default)]
struct CacheEntry {
    value: Option<Value>,
    stale: bool,
    generation: u64,
}

/// Shared store handle. Cloning shares the same entries.
#[derive(Clone, Default)]
pub struct CacheStore {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only handle for views.
    pub fn reader(&self) -> CacheReader {
        CacheReader {
            store: self.clone(),
        }
    }

    /// Fresh, stale or missing, with the cached value if any.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(CacheEntry {
                value: Some(value),
                stale: false,
                ..
            }) => Lookup::Fresh(value.clone()),
            Some(CacheEntry {
                value: Some(value),
                stale: true,
                ..
            }) => Lookup::Stale(value.clone()),
            _ => Lookup::Missing,
        }
    }

    /// Current value regardless of freshness.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.entries.read().get(key).and_then(|e| e.value.clone())
    }

    /// Missing entries count as stale.
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        !matches!(self.lookup(key), Lookup::Fresh(_))
    }

    /// Write counter for `key`; 0 if never written.
    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.entries.read().get(key).map_or(0, |e| e.generation)
    }

    /// All keys of `kind` for `id`, any list parameters.
    pub fn keys_matching(&self, kind: KeyKind, id: &str) -> Vec<CacheKey> {
        self.entries
            .read()
            .keys()
            .filter(|k| k.kind == kind && k.id == id)
            .cloned()
            .collect()
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn put(&self, key: CacheKey, value: Value) {
        let mut entries = self.entries.write();
        let entry = entries.entry(key).or_default();
        entry.value = Some(value);
        entry.stale = false;
        entry.generation += 1;
    }

    /// Mark `key` stale. Returns whether a value was cached.
    pub(crate) fn invalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_default();
        entry.stale = true;
        entry.generation += 1;
        entry.value.is_some()
    }

    /// Drop the value but keep the generation, so racing fills land stale.
    pub(crate) fn remove(&self, key: &CacheKey) -> Option<Value> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        entry.generation += 1;
        entry.stale = true;
        entry.value.take()
    }

    /// Drop every value. Generations survive so in-flight fills land stale.
    pub(crate) fn clear(&self) {
        for entry in self.entries.write().values_mut() {
            entry.value = None;
            entry.stale = true;
            entry.generation += 1;
        }
    }

    /// Store a fetched value. Fresh only if nothing wrote `key` since
    /// `generation` was read.
    pub(crate) fn fill(&self, key: &CacheKey, generation: u64, value: Value) -> bool {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_default();
        let fresh = entry.generation == generation;
        if fresh || entry.value.is_none() {
            entry.value = Some(value);
            entry.stale = !fresh;
        }
        fresh
    }
}

/// External query boundary used to refetch invalidated entries.
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, key: &CacheKey) -> impl Future<Output = Result<Value, SyncError>> + Send;
}

/// Read-only view of a [`CacheStore`].
#[derive(Clone)]
pub struct CacheReader {
    store: CacheStore,
}

impl CacheReader {
    /// See [`CacheStore::lookup`].
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        self.store.lookup(key)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        self.store.get(key)
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.store.is_stale(key)
    }

    /// Cache-aside read: serve fresh entries, refetch missing or stale ones.
    pub async fn read_through<F: ResourceFetcher>(
        &self,
        key: &CacheKey,
        fetcher: &F,
    ) -> Result<Value, SyncError> {
        if let Lookup::Fresh(value) = self.store.lookup(key) {
            return Ok(value);
        }
        let generation = self.store.generation(key);
        let value = fetcher.fetch(key).await?;
        if !self.store.fill(key, generation, value.clone()) {
            log::debug!("{key} changed while refetching; keeping it stale");
        }
        Ok(value)
    }
}
