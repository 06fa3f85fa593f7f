//! JSON wire protocol for workspace event synchronization.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! {
//!   "type":      "resource.status_changed",
//!   "payload":   { "status": "done" },
//!   "scope":     { "workspaceId": "P1", "resourceId": "I-42" },   // optional
//!   "origin":    "6f1c…",                                          // optional
//!   "timestamp": 1760000000000
//! }
//! ```
//!
//! A frame is either a [`ControlMessage`] (handshake, room membership,
//! heartbeat) or a [`DomainEvent`] from the closed [`EventKind`] set.
//! `origin` names the session whose action produced the event; a client
//! uses it to recognize its own echoes.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Identity of one authenticated session.
pub type SessionId = Uuid;

/// Workspace (project/board) identifier. Events and subscriptions are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

/// Identifier of a tracked resource (issue).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(WorkspaceId);
string_id!(ResourceId);

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Recipients and affected cache keys of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub workspace_id: WorkspaceId,
    pub resource_id: ResourceId,
}

impl Scope {
    pub fn new(workspace_id: impl Into<WorkspaceId>, resource_id: impl Into<ResourceId>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            resource_id: resource_id.into(),
        }
    }
}

/// The closed set of domain event types broadcast on state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResourceCreated,
    ResourceUpdated,
    ResourceStatusChanged,
    ResourceDeleted,
    CommentCreated,
    CommentUpdated,
    CommentDeleted,
    WorklogCreated,
    WorklogUpdated,
    WorklogDeleted,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::ResourceCreated,
        EventKind::ResourceUpdated,
        EventKind::ResourceStatusChanged,
        EventKind::ResourceDeleted,
        EventKind::CommentCreated,
        EventKind::CommentUpdated,
        EventKind::CommentDeleted,
        EventKind::WorklogCreated,
        EventKind::WorklogUpdated,
        EventKind::WorklogDeleted,
    ];

    /// Wire name, e.g. `resource.status_changed`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResourceCreated => "resource.created",
            Self::ResourceUpdated => "resource.updated",
            Self::ResourceStatusChanged => "resource.status_changed",
            Self::ResourceDeleted => "resource.deleted",
            Self::CommentCreated => "comment.created",
            Self::CommentUpdated => "comment.updated",
            Self::CommentDeleted => "comment.deleted",
            Self::WorklogCreated => "worklog.created",
            Self::WorklogUpdated => "worklog.updated",
            Self::WorklogDeleted => "worklog.deleted",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether the event describes the resource itself rather than a child
    /// (comment, worklog). Only these can confirm an optimistic mutation.
    pub fn is_resource_change(self) -> bool {
        matches!(
            self,
            Self::ResourceCreated
                | Self::ResourceUpdated
                | Self::ResourceStatusChanged
                | Self::ResourceDeleted
        )
    }

    /// String fields the payload must carry for this type.
    fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::ResourceCreated | Self::ResourceUpdated => &[],
            Self::ResourceStatusChanged => &["status"],
            Self::ResourceDeleted => &["resourceId", "workspaceId"],
            Self::CommentCreated | Self::CommentUpdated => &["resourceId"],
            Self::CommentDeleted => &["commentId", "resourceId"],
            Self::WorklogCreated | Self::WorklogUpdated => &["resourceId"],
            Self::WorklogDeleted => &["workLogId", "resourceId"],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read a non-empty string field from an object payload.
pub fn payload_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Raw message envelope, shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionId>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload,
            scope: None,
            origin: None,
            timestamp: now_millis(),
        }
    }

    /// Serialize to the JSON text carried by one frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse one frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A transient, typed notification that some resource changed.
///
/// Immutable once emitted; it has no persisted identity.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub scope: Scope,
    pub origin: Option<SessionId>,
    pub timestamp: u64,
}

impl DomainEvent {
    pub fn new(kind: EventKind, scope: Scope, payload: Value) -> Self {
        Self {
            kind,
            payload,
            scope,
            origin: None,
            timestamp: now_millis(),
        }
    }

    /// Attribute the event to the session whose action caused it.
    pub fn with_origin(mut self, origin: SessionId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.scope.workspace_id
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.scope.resource_id
    }

    /// Whether `session` originated this event.
    pub fn is_echo_for(&self, session: SessionId) -> bool {
        self.origin == Some(session)
    }

    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            msg_type: self.kind.as_str().to_string(),
            payload: self.payload.clone(),
            scope: Some(self.scope.clone()),
            origin: self.origin,
            timestamp: self.timestamp,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope().encode()
    }

    /// Validate an envelope against the expected shape for its declared type.
    ///
    /// A missing `scope` is recovered from the payload's `workspaceId` and
    /// `resourceId` (or `id` for resource representations).
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let kind = EventKind::parse(&envelope.msg_type)
            .ok_or_else(|| ProtocolError::UnknownType(envelope.msg_type.clone()))?;

        if !envelope.payload.is_object() {
            return Err(ProtocolError::malformed(kind, "payload is not an object"));
        }
        for field in kind.required_fields() {
            if payload_str(&envelope.payload, field).is_none() {
                return Err(ProtocolError::malformed(
                    kind,
                    format!("missing string field `{field}`"),
                ));
            }
        }

        let scope = match envelope.scope {
            Some(scope) => scope,
            None => scope_from_payload(kind, &envelope.payload)?,
        };

        Ok(Self {
            kind,
            payload: envelope.payload,
            scope,
            origin: envelope.origin,
            timestamp: envelope.timestamp,
        })
    }
}

fn scope_from_payload(kind: EventKind, payload: &Value) -> Result<Scope, ProtocolError> {
    let workspace = payload_str(payload, "workspaceId")
        .ok_or_else(|| ProtocolError::malformed(kind, "no scope and no `workspaceId`"))?;
    let resource = payload_str(payload, "resourceId")
        .or_else(|| {
            matches!(kind, EventKind::ResourceCreated | EventKind::ResourceUpdated)
                .then(|| payload_str(payload, "id"))
                .flatten()
        })
        .ok_or_else(|| ProtocolError::malformed(kind, "no scope and no `resourceId`"))?;
    Ok(Scope::new(workspace, resource))
}

/// Handshake, membership and heartbeat messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// First client frame: credentials for session admission.
    Hello { token: String },
    #[serde(rename_all = "camelCase")]
    Welcome { session_id: SessionId },
    AuthRejected { reason: String },
    #[serde(rename_all = "camelCase")]
    JoinWorkspace { workspace_id: WorkspaceId },
    #[serde(rename_all = "camelCase")]
    LeaveWorkspace { workspace_id: WorkspaceId },
    #[serde(rename_all = "camelCase")]
    WorkspaceJoined { workspace_id: WorkspaceId },
    #[serde(rename_all = "camelCase")]
    WorkspaceJoinRejected { workspace_id: WorkspaceId, reason: String },
    #[serde(rename_all = "camelCase")]
    WorkspaceLeft { workspace_id: WorkspaceId },
    Ping,
    Pong,
}

impl ControlMessage {
    const TYPES: [&'static str; 10] = [
        "hello",
        "welcome",
        "auth-rejected",
        "join-workspace",
        "leave-workspace",
        "workspace-joined",
        "workspace-join-rejected",
        "workspace-left",
        "ping",
        "pong",
    ];

    pub fn is_control_type(name: &str) -> bool {
        Self::TYPES.contains(&name)
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let tagged =
            serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let msg_type = payload_str(&tagged, "type")
            .ok_or_else(|| ProtocolError::Serialization("control message without tag".into()))?
            .to_string();
        let payload = tagged
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        Ok(Envelope::new(msg_type, payload))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.encode()
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if !Self::is_control_type(&envelope.msg_type) {
            return Err(ProtocolError::UnknownType(envelope.msg_type.clone()));
        }
        let mut tagged = Map::new();
        tagged.insert("type".into(), Value::String(envelope.msg_type.clone()));
        // Unit variants carry no content.
        let has_content = match &envelope.payload {
            Value::Null => false,
            Value::Object(fields) => !fields.is_empty(),
            _ => true,
        };
        if has_content {
            tagged.insert("payload".into(), envelope.payload.clone());
        }
        serde_json::from_value(Value::Object(tagged))
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Event(DomainEvent),
}

impl Frame {
    /// Decode and classify one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope = Envelope::decode(text)?;
        if EventKind::parse(&envelope.msg_type).is_some() {
            DomainEvent::from_envelope(envelope).map(Frame::Event)
        } else {
            ControlMessage::from_envelope(&envelope).map(Frame::Control)
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` event: {reason}")]
    Malformed { kind: EventKind, reason: String },
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

impl ProtocolError {
    fn malformed(kind: EventKind, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }

    /// Unknown types and malformed payloads are dropped rather than surfaced.
    pub fn is_droppable(&self) -> bool {
        matches!(
            self,
            Self::UnknownType(_) | Self::Malformed { .. } | Self::Deserialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_names_parse_back() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("resource.archived"), None);
    }

    #[test]
    fn test_status_changed_wire_shape() {
        let event = DomainEvent::new(
            EventKind::ResourceStatusChanged,
            Scope::new("P1", "I-42"),
            json!({ "status": "done" }),
        );
        let text = event.encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(raw["type"], "resource.status_changed");
        assert_eq!(raw["scope"]["workspaceId"], "P1");
        assert_eq!(raw["scope"]["resourceId"], "I-42");
        assert_eq!(raw["payload"]["status"], "done");
        assert!(raw.get("origin").is_none());

        match Frame::decode(&text).unwrap() {
            Frame::Event(decoded) => assert_eq!(decoded, event),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_scope_recovered_from_payload() {
        let text = r#"{"type":"resource.deleted","payload":{"resourceId":"I-9","workspaceId":"P2"},"timestamp":5}"#;
        let Frame::Event(event) = Frame::decode(text).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.scope, Scope::new("P2", "I-9"));
        assert_eq!(event.timestamp, 5);
    }

    #[test]
    fn test_resource_representation_uses_id_for_scope() {
        let text = r#"{"type":"resource.updated","payload":{"id":"I-3","workspaceId":"P1","title":"x"}}"#;
        let Frame::Event(event) = Frame::decode(text).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.resource_id().as_str(), "I-3");
    }

    #[test]
    fn test_malformed_known_type() {
        let text = r#"{"type":"comment.deleted","payload":{"resourceId":"I-1"},"scope":{"workspaceId":"P1","resourceId":"I-1"}}"#;
        let err = Frame::decode(text).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Malformed { kind: EventKind::CommentDeleted, .. }
        ));
        assert!(err.is_droppable());
    }

    #[test]
    fn test_status_changed_requires_status() {
        let text = r#"{"type":"resource.status_changed","payload":{},"scope":{"workspaceId":"P1","resourceId":"I-1"}}"#;
        assert!(matches!(
            Frame::decode(text),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_non_object_payload_is_malformed() {
        let text = r#"{"type":"resource.updated","payload":[1,2],"scope":{"workspaceId":"P1","resourceId":"I-1"}}"#;
        assert!(matches!(
            Frame::decode(text),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_droppable() {
        let err = Frame::decode(r#"{"type":"sprint.started","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("sprint.started".into()));
        assert!(err.is_droppable());
    }

    #[test]
    fn test_garbage_frame() {
        assert!(matches!(
            Frame::decode("not json"),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_join_workspace_wire_shape() {
        let msg = ControlMessage::JoinWorkspace {
            workspace_id: "P1".into(),
        };
        let raw: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(raw["type"], "join-workspace");
        assert_eq!(raw["payload"]["workspaceId"], "P1");
        assert!(raw["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_unit_control_messages_decode_with_empty_payload() {
        let Frame::Control(msg) = Frame::decode(r#"{"type":"ping","payload":{}}"#).unwrap() else {
            panic!("expected control");
        };
        assert_eq!(msg, ControlMessage::Ping);

        let encoded = ControlMessage::Pong.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Control(ControlMessage::Pong));
    }

    #[test]
    fn test_welcome_carries_session_id() {
        let session_id = Uuid::new_v4();
        let encoded = ControlMessage::Welcome { session_id }.encode().unwrap();
        assert_eq!(
            Frame::decode(&encoded).unwrap(),
            Frame::Control(ControlMessage::Welcome { session_id })
        );
    }

    #[test]
    fn test_control_missing_payload_field() {
        let err = Frame::decode(r#"{"type":"join-workspace","payload":{"workspace":"P1"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_echo_detection() {
        let me = Uuid::new_v4();
        let event = DomainEvent::new(
            EventKind::ResourceUpdated,
            Scope::new("P1", "I-1"),
            json!({}),
        )
        .with_origin(me);
        assert!(event.is_echo_for(me));
        assert!(!event.is_echo_for(Uuid::new_v4()));
        assert_eq!(event.to_envelope().origin, Some(me));
    }
}
