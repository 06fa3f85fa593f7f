//! # tracker-sync: Real-time event sync for an issue tracker
//!
//! Keeps every client's view of workspaces, issues, comments and work logs
//! consistent with the server without polling. The server routes domain
//! events to the sessions subscribed to a workspace; each client turns those
//! events into cache invalidations and reconciles its optimistic edits.
//!
//! ## Architecture
//!
//! ```text
//!  persistence ──CommittedChange──▶ ┌──────────────┐
//!                                   │ SyncServer   │
//!                                   │ rooms per    │
//!                                   │ workspace    │
//!                                   └──────┬───────┘
//!                                          │ JSON text frames
//!                       ┌──────────────────┴──────────────────┐
//!                       ▼                                     ▼
//!               ┌──────────────┐                      ┌──────────────┐
//!               │ SyncClient   │                      │ SyncClient   │
//!               └──────┬───────┘                      └──────────────┘
//!                      ▼
//!  ┌────────────── ClientSession (one sequential stream) ─────────────┐
//!  │ SubscriptionRegistry ─▶ MutationCoordinator ─▶ ReconciliationEngine│
//!  │                                  │                    │           │
//!  │                                  └──▶ CacheStore ◀────┘           │
//!  │                          NotificationFeed                         │
//!  └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - JSON envelope, event taxonomy, control messages
//! - [`broadcast`] - Per-workspace fan-out rooms
//! - [`dispatcher`] - Committed change → one broadcast event
//! - [`auth`] - Authentication and workspace access collaborators
//! - [`server`] - WebSocket sync server
//! - [`subscriptions`] - Client room membership across reconnects
//! - [`cache`] - Shared client cache with staleness and generations
//! - [`reconcile`] - Event → cache key invalidation with debounce
//! - [`optimistic`] - Optimistic mutations, confirm and rollback
//! - [`feed`] - Bounded user notification feed
//! - [`session`] - The per-session event-processing stream
//! - [`client`] - WebSocket sync client with reconnect and heartbeat

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod observer;
pub mod optimistic;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod subscriptions;

// Re-exports for convenience
pub use auth::{AccessPolicy, AuthDecision, Authenticator, Principal, StaticDirectory};
pub use broadcast::{RoomStats, WorkspaceRoom, WorkspaceRooms};
pub use cache::{CacheKey, CacheReader, CacheStore, KeyKind, Lookup, ResourceFetcher};
pub use client::{
    ClientConfig, ConnectionEvent, ConnectionState, Credentials, ReconnectPolicy, SyncClient,
    Topic,
};
pub use dispatcher::{CommittedChange, EventDispatcher};
pub use error::{Result, SyncError};
pub use feed::{FeedConfig, Notification, NotificationFeed, NotificationId, NotificationKind};
pub use observer::{ObserverRegistry, SubscriptionToken};
pub use optimistic::{
    CommandSink, MutationCommand, MutationConfig, MutationCoordinator, MutationOutcome,
    MutationStatus, MutationTicket, Resolution, ServerState,
};
pub use protocol::{
    ControlMessage, DomainEvent, Envelope, EventKind, Frame, ProtocolError, ResourceId, Scope,
    SessionId, WorkspaceId,
};
pub use reconcile::{Invalidation, ReconcileConfig, ReconciliationEngine};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ClientSession, SessionStats, TickReport};
pub use subscriptions::SubscriptionRegistry;
