//! Bounded, user-facing notification feed derived from the event stream.
//!
//! Newest entries first. Pushing past capacity evicts the oldest entry.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::protocol::{now_millis, payload_str, DomainEvent, EventKind, ResourceId};

pub type NotificationId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ResourceCreated,
    ResourceUpdated,
    StatusChanged,
    ResourceDeleted,
    CommentAdded,
    CommentEdited,
    CommentRemoved,
    WorkLogged,
    WorkLogEdited,
    WorkLogRemoved,
    MutationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub message: String,
    /// Navigation target, if the entry points somewhere
    pub link: Option<String>,
    pub resource_id: Option<ResourceId>,
    pub timestamp: u64,
}

pub struct NotificationFeed {
    capacity: usize,
    items: VecDeque<Notification>,
    next_id: NotificationId,
}

impl NotificationFeed {
    pub fn new(config: FeedConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity + 1),
            next_id: 0,
        }
    }

    /// Render `event` through its template and prepend it.
    pub fn push(&mut self, event: &DomainEvent) -> NotificationId {
        let (kind, message) = render(event);
        let resource = event.resource_id();
        let link = (event.kind != EventKind::ResourceDeleted)
            .then(|| format!("/workspaces/{}/resources/{resource}", event.workspace_id()));
        self.insert(kind, message, link, Some(resource.clone()), event.timestamp)
    }

    /// User-visible failure entry for a rolled-back mutation.
    pub fn push_mutation_failure(&mut self, resource: &ResourceId, error: &SyncError) -> NotificationId {
        let reason = match error {
            SyncError::MutationRejected { reason, .. } => reason.clone(),
            SyncError::MutationTimeout { .. } => "no response from server".to_string(),
            other => other.to_string(),
        };
        self.insert(
            NotificationKind::MutationFailed,
            format!("Could not update {resource}: {reason}"),
            None,
            Some(resource.clone()),
            now_millis(),
        )
    }

    pub fn dismiss(&mut self, id: NotificationId) -> bool {
        match self.items.iter().position(|n| n.id == id) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        self.items.clear();
    }

    /// Newest first.
    pub fn items(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn insert(
        &mut self,
        kind: NotificationKind,
        message: String,
        link: Option<String>,
        resource_id: Option<ResourceId>,
        timestamp: u64,
    ) -> NotificationId {
        self.next_id += 1;
        self.items.push_front(Notification {
            id: self.next_id,
            kind,
            message,
            link,
            resource_id,
            timestamp,
        });
        if self.items.len() > self.capacity {
            self.items.pop_back();
        }
        self.next_id
    }
}

fn render(event: &DomainEvent) -> (NotificationKind, String) {
    let id = event.resource_id();
    let title = payload_str(&event.payload, "title").unwrap_or(id.as_str());
    match event.kind {
        EventKind::ResourceCreated => (
            NotificationKind::ResourceCreated,
            format!("{title} was created"),
        ),
        EventKind::ResourceUpdated => (
            NotificationKind::ResourceUpdated,
            format!("{title} was updated"),
        ),
        EventKind::ResourceStatusChanged => {
            let status = payload_str(&event.payload, "status").unwrap_or("a new status");
            (
                NotificationKind::StatusChanged,
                format!("{id} moved to {status}"),
            )
        }
        EventKind::ResourceDeleted => (
            NotificationKind::ResourceDeleted,
            format!("{id} was deleted"),
        ),
        EventKind::CommentCreated => (NotificationKind::CommentAdded, format!("New comment on {id}")),
        EventKind::CommentUpdated => (NotificationKind::CommentEdited, format!("Comment edited on {id}")),
        EventKind::CommentDeleted => (
            NotificationKind::CommentRemoved,
            format!("Comment removed from {id}"),
        ),
        EventKind::WorklogCreated => (NotificationKind::WorkLogged, format!("Time logged on {id}")),
        EventKind::WorklogUpdated => (
            NotificationKind::WorkLogEdited,
            format!("Work log updated on {id}"),
        ),
        EventKind::WorklogDeleted => (
            NotificationKind::WorkLogRemoved,
            format!("Work log removed from {id}"),
        ),
    }
}
