//! Viewer registries: who is watching and who checked in.
//!
//! ```text
//!  spectator device            host device                 session document
//!  ────────────────            ───────────                 ────────────────
//!  join_as_spectator ──► spectators/{uid}
//!                              │ watch_members
//!                              ▼
//!                        spectator mirror ──── merge ────► connectedCount = n + 1
//!
//!  check_in ──────────► participants/{uid}
//!                              │ watch_members
//!                              ▼
//!                        participant mirror ── merge ────► participantCount,
//!                                                          isOfficialMatch
//! ```
//!
//! Counts are always recomputed from the live subcollection, never
//! incremented, so a missed leave cannot make them drift.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;

use crate::error::StoreError;
use crate::protocol::{ParticipantRecord, Roster, SessionPatch, SpectatorRecord};
use crate::store::SessionStore;
use crate::subscription::{Liveness, Subscription};
use crate::validation::{validate_match, GameMode};

/// Pause before a mirror resubscribes after its member watch broke.
pub const MIRROR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Registry operations over the two member subcollections.
#[derive(Clone)]
pub struct ViewerRegistry {
    store: Arc<dyn SessionStore>,
}

impl ViewerRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    // ─── Spectators ───────────────────────────────────────────────────

    pub async fn join_as_spectator(&self, session_id: &str, uid: &str) -> Result<(), StoreError> {
        let record = serde_json::to_value(SpectatorRecord::new(uid))?;
        self.store
            .put_member(session_id, Roster::Spectators, uid, record)
            .await?;
        log::info!("Spectator {uid} joined {session_id}");
        Ok(())
    }

    pub async fn leave_spectator(&self, session_id: &str, uid: &str) -> Result<(), StoreError> {
        self.store
            .remove_member(session_id, Roster::Spectators, uid)
            .await?;
        log::info!("Spectator {uid} left {session_id}");
        Ok(())
    }

    // ─── Participants ─────────────────────────────────────────────────

    pub async fn check_in(
        &self,
        session_id: &str,
        participant: &ParticipantRecord,
    ) -> Result<(), StoreError> {
        let record = serde_json::to_value(participant)?;
        self.store
            .put_member(session_id, Roster::Participants, &participant.uid, record)
            .await?;
        log::info!(
            "Participant {} ({:?}) checked in to {session_id}",
            participant.uid,
            participant.team
        );
        Ok(())
    }

    pub async fn check_out(&self, session_id: &str, uid: &str) -> Result<(), StoreError> {
        self.store
            .remove_member(session_id, Roster::Participants, uid)
            .await?;
        log::info!("Participant {uid} checked out of {session_id}");
        Ok(())
    }

    /// One-shot read of the checked-in players. Malformed records are skipped.
    pub async fn participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>, StoreError> {
        let members = self
            .store
            .list_members(session_id, Roster::Participants)
            .await?;
        Ok(decode_participants(members.into_iter().map(|(_, v)| v).collect()))
    }

    /// Best-effort bulk delete of a whole subcollection. Returns how many
    /// members were removed; failures are logged and reported as 0.
    pub async fn clear_roster(&self, session_id: &str, roster: Roster) -> usize {
        let ids: Vec<String> = match self.store.list_members(session_id, roster).await {
            Ok(members) => members.into_iter().map(|(id, _)| id).collect(),
            Err(e) => {
                log::warn!("Failed to list {roster} of {session_id} for cleanup: {e}");
                return 0;
            }
        };
        if ids.is_empty() {
            return 0;
        }
        match self.store.delete_members(session_id, roster, &ids).await {
            Ok(()) => {
                log::info!("Cleaned up {} {roster} of {session_id}", ids.len());
                ids.len()
            }
            Err(e) => {
                log::warn!("Failed to clean up {roster} of {session_id}: {e}");
                0
            }
        }
    }

    // ─── Live counts ──────────────────────────────────────────────────

    /// Read-only live member count. On a watch error the callback gets `0`
    /// once and the subscription ends.
    pub fn watch_count<F>(&self, session_id: &str, roster: Roster, on_count: F) -> Subscription
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let store = self.store.clone();
        let session_id = session_id.to_string();
        Subscription::spawn(move |liveness| async move {
            let mut members = store.watch_members(&session_id, roster).await;
            while let Some(event) = members.next().await {
                match event {
                    Ok(values) => {
                        if liveness.deliver(|| on_count(values.len())).is_none() {
                            return;
                        }
                    }
                    Err(e) => {
                        log::error!("{roster} count subscription for {session_id} failed: {e}");
                        liveness.finish(|| on_count(0));
                        return;
                    }
                }
            }
        })
    }

    /// Host side: mirror `spectators.len() + 1` into `connectedCount`.
    pub fn mirror_spectators(&self, session_id: &str) -> Subscription {
        self.mirror(session_id, Roster::Spectators, |members| {
            SessionPatch::connected_count(members.len() as u32 + 1)
        })
    }

    /// Host side: mirror unique checked-in players and the official flag.
    pub fn mirror_participants(&self, session_id: &str, mode: GameMode) -> Subscription {
        let required = mode.required_players();
        self.mirror(session_id, Roster::Participants, move |members| {
            let participants = decode_participants(members);
            let result = validate_match(&participants, required);
            SessionPatch::participants(result.confirmed_count as u32, result.is_validated)
        })
    }

    fn mirror<F>(&self, session_id: &str, roster: Roster, to_patch: F) -> Subscription
    where
        F: Fn(Vec<Value>) -> SessionPatch + Send + Sync + 'static,
    {
        let store = self.store.clone();
        let session_id = session_id.to_string();
        Subscription::spawn(move |liveness| async move {
            log::debug!("Mirroring {roster} of {session_id}");
            while liveness.is_alive() {
                run_mirror(&*store, &session_id, roster, &to_patch, &liveness).await;
                if !liveness.is_alive() {
                    break;
                }
                tokio::time::sleep(MIRROR_RETRY_DELAY).await;
            }
        })
    }
}

/// Follow one member watch until it breaks or the mirror is stopped.
async fn run_mirror<F>(
    store: &dyn SessionStore,
    session_id: &str,
    roster: Roster,
    to_patch: &F,
    liveness: &Liveness,
) where
    F: Fn(Vec<Value>) -> SessionPatch,
{
    let mut members = store.watch_members(session_id, roster).await;
    while let Some(event) = members.next().await {
        match event {
            Ok(values) => {
                let patch = to_patch(values);
                // stopped while waiting for the snapshot
                if !liveness.is_alive() {
                    return;
                }
                if let Err(e) = store.merge(session_id, patch).await {
                    log::warn!("Failed to mirror {roster} count into {session_id}: {e}");
                }
            }
            Err(e) => {
                log::error!("Host {roster} subscription for {session_id} failed: {e}");
                return;
            }
        }
    }
}

fn decode_participants(values: Vec<Value>) -> Vec<ParticipantRecord> {
    values
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(p) => Some(p),
            Err(e) => {
                log::warn!("Skipping malformed participant record: {e}");
                None
            }
        })
        .collect()
}
