//! JSON wire protocol between devices and the relay.
//!
//! Every WebSocket text frame carries one JSON object.
//!
//! ```text
//!  device ──► relay   RelayRequest { id, op: "merge", sessionId, patch }
//!  relay  ──► device  RelayFrame   { type: "ack", id }
//!
//!  device ──► relay   RelayRequest { id: 7, op: "watch", sessionId }
//!  relay  ──► device  { type: "ack", id: 7 }
//!                     { type: "snapshot", watchId: 7, doc }     (current)
//!                     { type: "snapshot", watchId: 7, doc }     (each change)
//!                     { type: "watchError", watchId: 7, error } (terminal)
//! ```
//!
//! A watch is identified by the id of the request that opened it.

use rally_sync::{Roster, SessionDocument, SessionPatch, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A store operation requested by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayOp {
    Create {
        session_id: String,
        doc: SessionDocument,
    },
    Merge {
        session_id: String,
        patch: SessionPatch,
    },
    Get {
        session_id: String,
    },
    Delete {
        session_id: String,
    },
    PutMember {
        session_id: String,
        roster: Roster,
        member_id: String,
        value: Value,
    },
    RemoveMember {
        session_id: String,
        roster: Roster,
        member_id: String,
    },
    ListMembers {
        session_id: String,
        roster: Roster,
    },
    DeleteMembers {
        session_id: String,
        roster: Roster,
        member_ids: Vec<String>,
    },
    Watch {
        session_id: String,
    },
    WatchMembers {
        session_id: String,
        roster: Roster,
    },
    Unwatch {
        watch_id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: u64,
    #[serde(flatten)]
    pub op: RelayOp,
}

impl RelayRequest {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One member of a subcollection in a `members` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    pub member_id: String,
    pub value: Value,
}

/// Kind of a [`StoreError`] carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultKind {
    NotFound,
    SessionFinished,
    Unavailable,
    Backend,
    Malformed,
}

/// Wire form of a [`StoreError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFault {
    pub kind: FaultKind,
    pub message: String,
}

impl From<&StoreError> for RelayFault {
    fn from(e: &StoreError) -> Self {
        let (kind, message) = match e {
            StoreError::NotFound(m) => (FaultKind::NotFound, m),
            StoreError::SessionFinished(m) => (FaultKind::SessionFinished, m),
            StoreError::Unavailable(m) => (FaultKind::Unavailable, m),
            StoreError::Backend(m) => (FaultKind::Backend, m),
            StoreError::Malformed(m) => (FaultKind::Malformed, m),
        };
        Self {
            kind,
            message: message.clone(),
        }
    }
}

impl From<RelayFault> for StoreError {
    fn from(f: RelayFault) -> Self {
        match f.kind {
            FaultKind::NotFound => StoreError::NotFound(f.message),
            FaultKind::SessionFinished => StoreError::SessionFinished(f.message),
            FaultKind::Unavailable => StoreError::Unavailable(f.message),
            FaultKind::Backend => StoreError::Backend(f.message),
            FaultKind::Malformed => StoreError::Malformed(f.message),
        }
    }
}

/// A frame sent by the relay: a response to a request or a watch push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    Ack {
        id: u64,
    },
    Document {
        id: u64,
        doc: Option<SessionDocument>,
    },
    Members {
        id: u64,
        members: Vec<MemberEntry>,
    },
    Error {
        id: u64,
        error: RelayFault,
    },
    Snapshot {
        watch_id: u64,
        doc: Option<SessionDocument>,
    },
    MemberSnapshot {
        watch_id: u64,
        members: Vec<Value>,
    },
    WatchError {
        watch_id: u64,
        error: RelayFault,
    },
}

impl RelayFrame {
    pub fn error(id: u64, e: &StoreError) -> Self {
        RelayFrame::Error {
            id,
            error: e.into(),
        }
    }

    /// Request id for responses, `None` for watch pushes.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            RelayFrame::Ack { id }
            | RelayFrame::Document { id, .. }
            | RelayFrame::Members { id, .. }
            | RelayFrame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let request = RelayRequest {
            id: 3,
            op: RelayOp::PutMember {
                session_id: "ABC12".into(),
                roster: Roster::Spectators,
                member_id: "u1".into(),
                value: json!({"uid": "u1"}),
            },
        };
        let value: Value = serde_json::from_str(&request.encode().unwrap()).unwrap();

        assert_eq!(value["id"], 3);
        assert_eq!(value["op"], "putMember");
        assert_eq!(value["sessionId"], "ABC12");
        assert_eq!(value["roster"], "spectators");
        assert_eq!(value["memberId"], "u1");
    }

    #[test]
    fn test_decode_merge_request() {
        let text = r#"{"id":9,"op":"merge","sessionId":"S","patch":{"connectedCount":4}}"#;
        let request = RelayRequest::decode(text).unwrap();
        assert_eq!(request.id, 9);
        assert_eq!(
            request.op,
            RelayOp::Merge {
                session_id: "S".into(),
                patch: SessionPatch::connected_count(4),
            }
        );
    }

    #[test]
    fn test_push_wire_shape() {
        let frame = RelayFrame::MemberSnapshot {
            watch_id: 7,
            members: vec![json!({"uid": "a"})],
        };
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "memberSnapshot");
        assert_eq!(value["watchId"], 7);
        assert_eq!(frame.request_id(), None);
    }

    #[test]
    fn test_fault_keeps_error_kind() {
        let original = StoreError::SessionFinished("ABC12".into());
        let frame = RelayFrame::error(4, &original);
        let decoded = RelayFrame::decode(&frame.encode().unwrap()).unwrap();

        match decoded {
            RelayFrame::Error { id, error } => {
                assert_eq!(id, 4);
                assert_eq!(StoreError::from(error), original);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
