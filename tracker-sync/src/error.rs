//! Error taxonomy for the synchronization layer.
//!
//! Connection failures are session-wide (one offline indicator); mutation
//! failures belong to the interaction that started them. Nothing here is
//! fatal to the process.

use thiserror::Error;

use crate::protocol::{ProtocolError, ResourceId, WorkspaceId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Transport could not be established or maintained.
    #[error("connection error: {0}")]
    Connection(String),

    /// Join rejected by server-side admission.
    #[error("join rejected for workspace {workspace}: {reason}")]
    Subscription {
        workspace: WorkspaceId,
        reason: String,
    },

    /// No ack or echo arrived within the mutation timeout.
    #[error("mutation on {resource} timed out")]
    MutationTimeout { resource: ResourceId },

    /// Server refused the command.
    #[error("mutation on {resource} rejected: {reason}")]
    MutationRejected { resource: ResourceId, reason: String },

    /// A mutation for this resource is already pending.
    #[error("mutation in progress for {resource}")]
    MutationInProgress { resource: ResourceId },

    /// Event payload did not match its declared type.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Cache-aside refetch through the query boundary failed.
    #[error("fetch of {key} failed: {reason}")]
    Fetch { key: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
