//! Per-workspace fan-out rooms.
//!
//! Every workspace with at least one subscribed session owns a tokio
//! broadcast channel. An event is encoded once and the same `Arc<str>` frame
//! is handed to every receiver, so fan-out never re-serializes. A session
//! only ever holds receivers for rooms it joined, which is what keeps events
//! from crossing workspace boundaries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{SessionId, WorkspaceId};

/// Encoded text frame shared by all receivers of one publish.
pub type SharedFrame = Arc<str>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

struct AtomicRoomStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single workspace.
pub struct WorkspaceRoom {
    sender: broadcast::Sender<SharedFrame>,
    sessions: RwLock<HashSet<SessionId>>,
    stats: AtomicRoomStats,
}

impl WorkspaceRoom {
    /// `capacity` bounds how far a slow session may lag before it starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: RwLock::new(HashSet::new()),
            stats: AtomicRoomStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Returns `None` if the session was already a member.
    pub async fn add_session(&self, session: SessionId) -> Option<broadcast::Receiver<SharedFrame>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session).then(|| self.sender.subscribe())
    }

    /// Returns whether the session was a member.
    pub async fn remove_session(&self, session: &SessionId) -> bool {
        self.sessions.write().await.remove(session)
    }

    /// Lock-free publish. Returns the number of receivers reached.
    pub fn publish(&self, frame: SharedFrame) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    /// Count frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Number of sessions in this room.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of room statistics.
    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }
}

/// Maps workspace ids to rooms. Rooms are created on first join and
/// removed when their last session leaves.
pub struct WorkspaceRooms {
    rooms: RwLock<HashMap<WorkspaceId, Arc<WorkspaceRoom>>>,
    capacity: usize,
}

impl WorkspaceRooms {
    /// `capacity` is passed to every room created.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get the room for a workspace, if anyone is in it.
    pub async fn get(&self, workspace: &WorkspaceId) -> Option<Arc<WorkspaceRoom>> {
        self.rooms.read().await.get(workspace).cloned()
    }

    /// Add `session` to the workspace room. Returns `None` on a duplicate
    /// join, so the caller keeps its existing receiver.
    pub async fn join(
        &self,
        workspace: &WorkspaceId,
        session: SessionId,
    ) -> Option<broadcast::Receiver<SharedFrame>> {
        // Held across the insert so a concurrent last-leave cannot orphan the room.
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(workspace.clone())
            .or_insert_with(|| Arc::new(WorkspaceRoom::new(self.capacity)));
        room.add_session(session).await
    }

    /// Remove `session` from the workspace room, closing the room when it
    /// becomes empty. Returns whether the session was a member.
    pub async fn leave(&self, workspace: &WorkspaceId, session: &SessionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(workspace) else {
            return false;
        };
        let removed = room.remove_session(session).await;
        if room.session_count().await == 0 {
            rooms.remove(workspace);
            log::debug!("closed empty room {workspace}");
        }
        removed
    }

    /// Publish to one workspace. No room means no subscribers.
    pub async fn publish(&self, workspace: &WorkspaceId, frame: SharedFrame) -> usize {
        match self.get(workspace).await {
            Some(room) => room.publish(frame),
            None => 0,
        }
    }

    /// Number of sessions subscribed to a workspace.
    pub async fn session_count(&self, workspace: &WorkspaceId) -> usize {
        match self.get(workspace).await {
            Some(room) => room.session_count().await,
            None => 0,
        }
    }

    /// Number of open rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Workspaces that currently have a room.
    pub async fn active_workspaces(&self) -> Vec<WorkspaceId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_duplicate_join_returns_none() {
        let rooms = WorkspaceRooms::new(16);
        let session = Uuid::new_v4();
        let ws = WorkspaceId::new("P1");

        assert!(rooms.join(&ws, session).await.is_some());
        assert!(rooms.join(&ws, session).await.is_none());
        assert_eq!(rooms.session_count(&ws).await, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_its_workspace() {
        let rooms = WorkspaceRooms::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_p1 = rooms.join(&"P1".into(), a).await.unwrap();
        let mut rx_p2 = rooms.join(&"P2".into(), b).await.unwrap();

        let reached = rooms.publish(&"P1".into(), Arc::from("frame")).await;
        assert_eq!(reached, 1);
        assert_eq!(&*rx_p1.recv().await.unwrap(), "frame");
        assert!(rx_p2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_room_is_noop() {
        let rooms = WorkspaceRooms::new(16);
        assert_eq!(rooms.publish(&"P9".into(), Arc::from("x")).await, 0);
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_last_leave_removes_room() {
        let rooms = WorkspaceRooms::new(16);
        let ws = WorkspaceId::new("P1");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let _rx_a = rooms.join(&ws, a).await;
        let _rx_b = rooms.join(&ws, b).await;

        assert!(rooms.leave(&ws, &a).await);
        assert_eq!(rooms.room_count().await, 1);
        assert!(rooms.leave(&ws, &b).await);
        assert_eq!(rooms.room_count().await, 0);
        assert!(!rooms.leave(&ws, &b).await);
    }

    #[tokio::test]
    async fn test_room_stats() {
        let room = WorkspaceRoom::new(16);
        let _rx = room.add_session(Uuid::new_v4()).await;
        room.publish(Arc::from("a"));
        room.publish(Arc::from("b"));
        room.record_dropped(3);

        let stats = room.stats().await;
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_sessions, 1);
    }
}
