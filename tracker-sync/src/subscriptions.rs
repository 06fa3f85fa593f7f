//! Client-side room subscription registry.
//!
//! Keeps the *desired* membership set, which survives disconnects and
//! rejected joins, apart from the *live* set the server has admitted on the
//! current transport. Every operation returns the control messages to send,
//! so the registry itself does no I/O.

use std::collections::{BTreeSet, HashSet};

use crate::error::SyncError;
use crate::protocol::{ControlMessage, WorkspaceId};

#[derive(Debug)]
pub struct SubscriptionRegistry {
    desired: BTreeSet<WorkspaceId>,
    live: HashSet<WorkspaceId>,
    /// Joins sent on the current transport, awaiting admission.
    requested: HashSet<WorkspaceId>,
    suspended: bool,
}

impl SubscriptionRegistry {
    /// A registry starts suspended until the first connect.
    pub fn new() -> Self {
        Self {
            desired: BTreeSet::new(),
            live: HashSet::new(),
            requested: HashSet::new(),
            suspended: true,
        }
    }

    /// Idempotent while the workspace is live or its join is in flight.
    /// A desired workspace whose last join was rejected is requested again.
    pub fn join(&mut self, workspace: WorkspaceId) -> Option<ControlMessage> {
        let fresh = self.desired.insert(workspace.clone());
        if self.suspended {
            if fresh {
                log::debug!("join {workspace} deferred until connected");
            }
            return None;
        }
        if self.live.contains(&workspace) || !self.requested.insert(workspace.clone()) {
            return None;
        }
        Some(ControlMessage::JoinWorkspace {
            workspace_id: workspace,
        })
    }

    /// Idempotent: leaving a workspace that is not desired is a no-op.
    /// Routing for the workspace stops immediately.
    pub fn leave(&mut self, workspace: &WorkspaceId) -> Option<ControlMessage> {
        if !self.desired.remove(workspace) {
            return None;
        }
        self.live.remove(workspace);
        self.requested.remove(workspace);
        if self.suspended {
            return None;
        }
        Some(ControlMessage::LeaveWorkspace {
            workspace_id: workspace.clone(),
        })
    }

    /// Transport (re)established: re-issue joins for every desired workspace
    /// not already live or requested.
    pub fn on_connected(&mut self) -> Vec<ControlMessage> {
        self.suspended = false;
        let pending: Vec<WorkspaceId> = self
            .desired
            .iter()
            .filter(|ws| !self.live.contains(*ws) && !self.requested.contains(*ws))
            .cloned()
            .collect();
        pending
            .into_iter()
            .map(|workspace_id| {
                self.requested.insert(workspace_id.clone());
                ControlMessage::JoinWorkspace { workspace_id }
            })
            .collect()
    }

    /// Transport lost: stop delivery, keep membership.
    pub fn suspend(&mut self) {
        self.suspended = true;
        self.live.clear();
        self.requested.clear();
    }

    /// Server admitted a join. Returns `false` if it is no longer desired.
    pub fn on_joined(&mut self, workspace: &WorkspaceId) -> bool {
        self.requested.remove(workspace);
        if self.suspended || !self.desired.contains(workspace) {
            return false;
        }
        self.live.insert(workspace.clone())
    }

    /// Server rejected a join. The desired set is untouched, so the next
    /// reconnect retries without a fresh `join`.
    pub fn on_join_rejected(&mut self, workspace: &WorkspaceId, reason: &str) -> SyncError {
        self.requested.remove(workspace);
        self.live.remove(workspace);
        SyncError::Subscription {
            workspace: workspace.clone(),
            reason: reason.to_string(),
        }
    }

    pub fn on_left(&mut self, workspace: &WorkspaceId) {
        self.live.remove(workspace);
    }

    /// Whether an event scoped to `workspace` may be delivered.
    pub fn accepts(&self, workspace: &WorkspaceId) -> bool {
        !self.suspended && self.live.contains(workspace)
    }

    pub fn is_desired(&self, workspace: &WorkspaceId) -> bool {
        self.desired.contains(workspace)
    }

    pub fn is_live(&self, workspace: &WorkspaceId) -> bool {
        self.live.contains(workspace)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn desired(&self) -> impl Iterator<Item = &WorkspaceId> {
        self.desired.iter()
    }

    pub fn live(&self) -> impl Iterator<Item = &WorkspaceId> {
        self.live.iter()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
