//! Official-match validation.
//!
//! A broadcast session counts as an official match when enough distinct,
//! real players checked in:
//!
//! 1. at least `2 × players on court` participants for the game mode;
//! 2. every participant has a unique uid;
//! 3. every participant checked in from a unique device.
//!
//! Pure functions, no I/O.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::protocol::ParticipantRecord;

/// Game mode presets with a fixed number of players per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameMode {
    #[serde(rename = "indoor-6v6")]
    Indoor6v6,
    #[serde(rename = "quads-5v5")]
    Quads5v5,
    #[serde(rename = "beach-4v4")]
    Beach4v4,
    #[serde(rename = "triples-3v3")]
    Triples3v3,
    #[serde(rename = "beach-2v2")]
    Beach2v2,
}

impl GameMode {
    pub fn players_on_court(&self) -> usize {
        match self {
            GameMode::Indoor6v6 => 6,
            GameMode::Quads5v5 => 5,
            GameMode::Beach4v4 => 4,
            GameMode::Triples3v3 => 3,
            GameMode::Beach2v2 => 2,
        }
    }

    /// Checked-in players needed for the match to be official.
    pub fn required_players(&self) -> usize {
        2 * self.players_on_court()
    }
}

/// Three-tier status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Insufficient,
    Casual,
    Official,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationIssue {
    InsufficientPlayers { current: usize, required: usize },
    DuplicateUid { uid: String },
    DuplicateDevice { fingerprint: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    pub is_validated: bool,
    /// Unique uids only.
    pub confirmed_count: usize,
    pub required_count: usize,
    pub issues: Vec<ValidationIssue>,
}

/// Validate a participant list against the required player count.
pub fn validate_match(participants: &[ParticipantRecord], required: usize) -> ValidationResult {
    let mut issues = Vec::new();

    if participants.len() < required {
        issues.push(ValidationIssue::InsufficientPlayers {
            current: participants.len(),
            required,
        });
    }

    let mut uids = HashSet::new();
    for p in participants {
        if !uids.insert(p.uid.as_str()) {
            issues.push(ValidationIssue::DuplicateUid { uid: p.uid.clone() });
        }
    }

    let mut devices = HashSet::new();
    for p in participants {
        if !devices.insert(p.device_fingerprint.as_str()) {
            issues.push(ValidationIssue::DuplicateDevice {
                fingerprint: p.device_fingerprint.clone(),
            });
        }
    }

    let confirmed = uids.len();
    let is_validated = issues.is_empty() && participants.len() >= required;

    ValidationResult {
        status: validation_status(confirmed, required, issues.is_empty()),
        is_validated,
        confirmed_count: confirmed,
        required_count: required,
        issues,
    }
}

pub fn validation_status(unique_count: usize, required: usize, no_issues: bool) -> ValidationStatus {
    if unique_count >= required && no_issues {
        ValidationStatus::Official
    } else if unique_count > 0 {
        ValidationStatus::Casual
    } else {
        ValidationStatus::Insufficient
    }
}
