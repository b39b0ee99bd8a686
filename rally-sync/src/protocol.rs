//! Session document model shared by the engine, the stores, and the relay.
//!
//! Remote layout (one document per session, two member subcollections):
//! ```text
//! live_matches/{session_id}
//! ┌──────────────────────────────────────────────────────────────┐
//! │ hostUid │ status │ connectedCount │ lastUpdate │ state (JSON) │
//! │ isOfficialMatch? │ participantCount?                          │
//! └──────────────────────────────────────────────────────────────┘
//!      ├── spectators/{uid}    { uid, joinedAt }
//!      └── participants/{uid}  { uid, profileId, name, avatar?, team,
//!                                deviceFingerprint, checkedInAt, role }
//! ```
//!
//! Field names on the wire are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

/// Lifecycle status of a live session. Only ever moves `Active → Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Finished,
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Finished)
    }
}

/// Result of a one-shot session probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionProbe {
    Active,
    Finished,
    NotFound,
}

/// The authoritative session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub host_uid: String,
    pub status: SessionStatus,
    pub connected_count: u32,
    /// Server-assigned time of the last write, epoch milliseconds.
    #[serde(default)]
    pub last_update: Option<u64>,
    /// Opaque, sanitized match state.
    #[serde(default)]
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_official_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
}

impl SessionDocument {
    /// A freshly hosted session: active, host counted as the one viewer.
    pub fn hosted(host_uid: impl Into<String>, state: Value) -> Self {
        Self {
            host_uid: host_uid.into(),
            status: SessionStatus::Active,
            connected_count: 1,
            last_update: None,
            state,
            is_official_match: None,
            participant_count: None,
        }
    }

    /// Apply an upsert-merge patch in place. Fields absent from the patch are
    /// left untouched. `now_ms` is the store's clock for `lastUpdate`.
    pub fn apply(&mut self, patch: &SessionPatch, now_ms: u64) {
        if let Some(status) = patch.status {
            // finished is terminal
            if !self.status.is_finished() {
                self.status = status;
            }
        }
        if let Some(count) = patch.connected_count {
            self.connected_count = count;
        }
        if let Some(state) = &patch.state {
            self.state = state.clone();
        }
        if let Some(flag) = patch.is_official_match {
            self.is_official_match = Some(flag);
        }
        if let Some(count) = patch.participant_count {
            self.participant_count = Some(count);
        }
        if patch.touch {
            self.last_update = Some(now_ms);
        }
    }

    /// Build a document from a patch when the target does not exist yet
    /// (upsert). Missing required fields take neutral defaults.
    pub fn from_patch(patch: &SessionPatch, now_ms: u64) -> Self {
        let mut doc = Self {
            host_uid: String::new(),
            status: SessionStatus::Active,
            connected_count: 0,
            last_update: None,
            state: Value::Null,
            is_official_match: None,
            participant_count: None,
        };
        doc.apply(patch, now_ms);
        doc
    }
}

/// An upsert-merge write: only the populated fields are written.
///
/// `touch` asks the store to stamp `lastUpdate` with its own clock, the
/// stand-in for a server timestamp sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_official_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_count: Option<u32>,
    #[serde(default)]
    pub touch: bool,
}

impl SessionPatch {
    /// State broadcast: `state` + `lastUpdate`, nothing else.
    pub fn state(state: Value) -> Self {
        Self {
            state: Some(state),
            touch: true,
            ..Self::default()
        }
    }

    /// Mark the session finished.
    pub fn finish() -> Self {
        Self {
            status: Some(SessionStatus::Finished),
            touch: true,
            ..Self::default()
        }
    }

    /// Mirror of the spectator subcollection size (host included).
    pub fn connected_count(count: u32) -> Self {
        Self {
            connected_count: Some(count),
            ..Self::default()
        }
    }

    /// Mirror of the participant subcollection.
    pub fn participants(count: u32, is_official: bool) -> Self {
        Self {
            participant_count: Some(count),
            is_official_match: Some(is_official),
            ..Self::default()
        }
    }

    /// Whether this patch writes match state.
    pub fn writes_state(&self) -> bool {
        self.state.is_some()
    }
}

/// Which member subcollection of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Roster {
    Spectators,
    Participants,
}

impl Roster {
    pub fn as_str(&self) -> &'static str {
        match self {
            Roster::Spectators => "spectators",
            Roster::Participants => "participants",
        }
    }
}

impl std::fmt::Display for Roster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One passive viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectatorRecord {
    pub uid: String,
    /// Epoch milliseconds.
    pub joined_at: u64,
}

impl SpectatorRecord {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            joined_at: now_millis(),
        }
    }
}

/// Team assignment of a checked-in player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Team {
    A,
    B,
    #[serde(rename = "unassigned")]
    Unassigned,
}

/// Role of a checked-in player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Player,
}

/// A checked-in player, used for official-match validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub uid: String,
    pub profile_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub team: Team,
    pub device_fingerprint: String,
    /// Epoch milliseconds.
    pub checked_in_at: u64,
    pub role: ParticipantRole,
}

impl ParticipantRecord {
    /// A player checking in now, not yet on a team.
    pub fn player(
        uid: impl Into<String>,
        profile_id: impl Into<String>,
        name: impl Into<String>,
        device_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            profile_id: profile_id.into(),
            name: name.into(),
            avatar: None,
            team: Team::Unassigned,
            device_fingerprint: device_fingerprint.into(),
            checked_in_at: now_millis(),
            role: ParticipantRole::Player,
        }
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.team = team;
        self
    }

    pub fn with_role(mut self, role: ParticipantRole) -> Self {
        self.role = role;
        self
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
