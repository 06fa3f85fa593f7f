//! Authentication and workspace access checks.
//!
//! The server asks an [`Authenticator`] who a `hello` token belongs to and an
//! [`AccessPolicy`] whether that principal may join a workspace. Both are
//! owned by the host application; [`StaticDirectory`] is an in-memory
//! implementation for development servers and tests.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{SessionId, WorkspaceId};

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Stable across reconnects with the same credentials.
    pub session_id: SessionId,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accepted(Principal),
    Rejected(String),
}

pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> AuthDecision;
}

pub trait AccessPolicy: Send + Sync + 'static {
    /// `Err(reason)` denies the join.
    fn authorize_join(&self, principal: &Principal, workspace: &WorkspaceId) -> Result<(), String>;
}

#[derive(Debug, Clone)]
struct Grant {
    principal: Principal,
    workspaces: HashSet<WorkspaceId>,
}

/// Token table with per-user workspace grants.
#[derive(Default)]
pub struct StaticDirectory {
    grants: RwLock<HashMap<String, Grant>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for `user`. Returns the session id it maps to.
    pub fn insert<I, W>(&self, token: impl Into<String>, user: impl Into<String>, workspaces: I) -> SessionId
    where
        I: IntoIterator<Item = W>,
        W: Into<WorkspaceId>,
    {
        let principal = Principal {
            session_id: Uuid::new_v4(),
            user: user.into(),
        };
        let session_id = principal.session_id;
        self.grants.write().insert(
            token.into(),
            Grant {
                principal,
                workspaces: workspaces.into_iter().map(Into::into).collect(),
            },
        );
        session_id
    }

    pub fn grant(&self, token: &str, workspace: impl Into<WorkspaceId>) -> bool {
        match self.grants.write().get_mut(token) {
            Some(grant) => grant.workspaces.insert(workspace.into()),
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) -> Option<Principal> {
        self.grants.write().remove(token).map(|g| g.principal)
    }

    pub fn len(&self) -> usize {
        self.grants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.read().is_empty()
    }
}

impl Authenticator for StaticDirectory {
    fn authenticate(&self, token: &str) -> AuthDecision {
        match self.grants.read().get(token) {
            Some(grant) => AuthDecision::Accepted(grant.principal.clone()),
            None => AuthDecision::Rejected("unknown or expired token".to_string()),
        }
    }
}

impl AccessPolicy for StaticDirectory {
    fn authorize_join(&self, principal: &Principal, workspace: &WorkspaceId) -> Result<(), String> {
        let grants = self.grants.read();
        let allowed = grants
            .values()
            .find(|g| g.principal.session_id == principal.session_id)
            .is_some_and(|g| g.workspaces.contains(workspace));
        if allowed {
            Ok(())
        } else {
            Err(format!("{} may not access {workspace}", principal.user))
        }
    }
}
