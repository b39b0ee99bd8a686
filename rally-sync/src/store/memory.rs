//! In-process session store with live fan-out.
//!
//! Every session gets a room holding the document, its two member
//! subcollections, and tokio broadcast channels that push changes to
//! watchers. Each watcher gets an independent receiver; a lagging watcher
//! skips ahead, which is harmless because every item carries the full
//! latest value.
//!
//! The store also carries fault-injection switches (reachability, failing
//! writes, slow writes, broken watches) and write statistics so the engine's
//! offline behaviour can be exercised without a network. The relay server
//! uses it as its backing store with all faults off.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use super::{MemberStream, SessionStore, SnapshotStream};
use crate::error::StoreError;
use crate::protocol::{now_millis, Roster, SessionDocument, SessionPatch};

type DocEvent = Result<Option<SessionDocument>, StoreError>;
type MemberEvent = Result<Vec<Value>, StoreError>;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One session: document + subcollections + change channels.
struct SessionRoom {
    doc: Option<SessionDocument>,
    spectators: BTreeMap<String, Value>,
    participants: BTreeMap<String, Value>,
    doc_tx: broadcast::Sender<DocEvent>,
    spectators_tx: broadcast::Sender<MemberEvent>,
    participants_tx: broadcast::Sender<MemberEvent>,
}

impl SessionRoom {
    fn new(capacity: usize) -> Self {
        let (doc_tx, _) = broadcast::channel(capacity);
        let (spectators_tx, _) = broadcast::channel(capacity);
        let (participants_tx, _) = broadcast::channel(capacity);
        Self {
            doc: None,
            spectators: BTreeMap::new(),
            participants: BTreeMap::new(),
            doc_tx,
            spectators_tx,
            participants_tx,
        }
    }

    fn members(&self, roster: Roster) -> &BTreeMap<String, Value> {
        match roster {
            Roster::Spectators => &self.spectators,
            Roster::Participants => &self.participants,
        }
    }

    fn members_mut(&mut self, roster: Roster) -> &mut BTreeMap<String, Value> {
        match roster {
            Roster::Spectators => &mut self.spectators,
            Roster::Participants => &mut self.participants,
        }
    }

    fn member_tx(&self, roster: Roster) -> &broadcast::Sender<MemberEvent> {
        match roster {
            Roster::Spectators => &self.spectators_tx,
            Roster::Participants => &self.participants_tx,
        }
    }

    fn publish_doc(&self) {
        // no receivers is fine
        let _ = self.doc_tx.send(Ok(self.doc.clone()));
    }

    fn publish_members(&self, roster: Roster) {
        let values = self.members(roster).values().cloned().collect();
        let _ = self.member_tx(roster).send(Ok(values));
    }
}

/// Fault switches and write statistics.
#[derive(Default)]
struct Faults {
    unreachable: AtomicBool,
    failing_writes: AtomicU32,
    failing_watches: AtomicU32,
    write_delay_ms: AtomicU64,
    merge_calls: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    state_writes: Mutex<Vec<(String, Value)>>,
}

/// Decrements the in-flight write counter on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of the store's write statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStoreStats {
    pub merge_calls: u64,
    pub state_writes: usize,
    pub max_concurrent_writes: usize,
    pub active_sessions: usize,
}

/// In-memory [`SessionStore`].
#[derive(Clone)]
pub struct MemoryStore {
    rooms: Arc<RwLock<HashMap<String, SessionRoom>>>,
    faults: Arc<Faults>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// `capacity` is the per-watcher buffer before a slow watcher lags.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Faults::default()),
            capacity,
        }
    }

    // ─── Fault injection ──────────────────────────────────────────────

    /// When unreachable every call fails with [`StoreError::Unavailable`] and
    /// new watches yield one error and end.
    pub fn set_reachable(&self, reachable: bool) {
        self.faults.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Fail the next `n` document writes (`create`/`merge`).
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.failing_writes.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to [`SessionStore::watch`] yield one error and end.
    pub fn fail_next_watches(&self, n: u32) {
        self.faults.failing_watches.store(n, Ordering::SeqCst);
    }

    /// Hold every document write for `delay` before applying it.
    pub fn set_write_delay(&self, delay: Duration) {
        self.faults
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Push a transport error to everyone watching `session_id`.
    pub async fn break_watchers(&self, session_id: &str, error: StoreError) {
        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(session_id) {
            let _ = room.doc_tx.send(Err(error));
        }
    }

    // ─── Inspection ───────────────────────────────────────────────────

    /// Every state payload written through `merge`, in order.
    pub fn state_writes(&self) -> Vec<(String, Value)> {
        self.faults
            .state_writes
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> MemoryStoreStats {
        let rooms = self.rooms.read().await;
        MemoryStoreStats {
            merge_calls: self.faults.merge_calls.load(Ordering::SeqCst),
            state_writes: self.state_writes().len(),
            max_concurrent_writes: self.faults.max_in_flight.load(Ordering::SeqCst),
            active_sessions: rooms.values().filter(|r| r.doc.is_some()).count(),
        }
    }

    /// Number of live watchers on a session document.
    pub async fn watcher_count(&self, session_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(session_id)
            .map_or(0, |r| r.doc_tx.receiver_count())
    }

    pub async fn member_count(&self, session_id: &str, roster: Roster) -> usize {
        self.rooms
            .read()
            .await
            .get(session_id)
            .map_or(0, |r| r.members(roster).len())
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.faults.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store unreachable".into()));
        }
        Ok(())
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Shared prologue of document writes: concurrency tracking, delay,
    /// reachability and injected failures.
    async fn begin_write(&self) -> Result<InFlight<'_>, StoreError> {
        let now = self.faults.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.faults.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.faults.in_flight);

        let delay = self.faults.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_reachable()?;
        if Self::take(&self.faults.failing_writes) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        Ok(guard)
    }

    fn failed_stream<T: Send + 'static>(error: StoreError) -> BoxedResultStream<T> {
        stream::once(async move { Err(error) }).boxed()
    }

    fn follow<T: Clone + Send + 'static>(
        initial: Result<T, StoreError>,
        rx: broadcast::Receiver<Result<T, StoreError>>,
    ) -> BoxedResultStream<T> {
        let updates = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        log::debug!("Watcher lagged, skipped {skipped} snapshots");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        stream::once(async move { initial }).chain(updates).boxed()
    }
}

type BoxedResultStream<T> = futures_util::stream::BoxStream<'static, Result<T, StoreError>>;

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session_id: &str, mut doc: SessionDocument) -> Result<(), StoreError> {
        let _guard = self.begin_write().await?;
        doc.last_update = Some(now_millis());

        let mut rooms = self.rooms.write().await;
        let capacity = self.capacity;
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRoom::new(capacity));
        room.doc = Some(doc);
        room.publish_doc();
        Ok(())
    }

    async fn merge(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError> {
        self.faults.merge_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.begin_write().await?;
        let now = now_millis();

        let mut rooms = self.rooms.write().await;
        let capacity = self.capacity;
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRoom::new(capacity));

        match room.doc.as_mut() {
            Some(doc) => {
                if doc.status.is_finished() && patch.writes_state() {
                    return Err(StoreError::SessionFinished(session_id.to_string()));
                }
                doc.apply(&patch, now);
            }
            None => room.doc = Some(SessionDocument::from_patch(&patch, now)),
        }

        if let Some(state) = &patch.state {
            if let Ok(mut writes) = self.faults.state_writes.lock() {
                writes.push((session_id.to_string(), state.clone()));
            }
        }
        room.publish_doc();
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError> {
        self.check_reachable()?;
        let rooms = self.rooms.read().await;
        Ok(rooms.get(session_id).and_then(|r| r.doc.clone()))
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(session_id) {
            room.doc = None;
            room.publish_doc();
        }
        Ok(())
    }

    async fn watch(&self, session_id: &str) -> SnapshotStream {
        if let Err(e) = self.check_reachable() {
            return Self::failed_stream(e);
        }
        if Self::take(&self.faults.failing_watches) {
            return Self::failed_stream(StoreError::Unavailable("injected watch failure".into()));
        }

        let mut rooms = self.rooms.write().await;
        let capacity = self.capacity;
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRoom::new(capacity));
        Self::follow(Ok(room.doc.clone()), room.doc_tx.subscribe())
    }

    async fn put_member(
        &self,
        session_id: &str,
        roster: Roster,
        member_id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut rooms = self.rooms.write().await;
        let capacity = self.capacity;
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRoom::new(capacity));
        room.members_mut(roster).insert(member_id.to_string(), value);
        room.publish_members(roster);
        Ok(())
    }

    async fn remove_member(
        &self,
        session_id: &str,
        roster: Roster,
        member_id: &str,
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(session_id) {
            if room.members_mut(roster).remove(member_id).is_some() {
                room.publish_members(roster);
            }
        }
        Ok(())
    }

    async fn list_members(
        &self,
        session_id: &str,
        roster: Roster,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        self.check_reachable()?;
        let rooms = self.rooms.read().await;
        Ok(rooms
            .get(session_id)
            .map(|r| {
                r.members(roster)
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_members(
        &self,
        session_id: &str,
        roster: Roster,
        member_ids: &[String],
    ) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(session_id) {
            let members = room.members_mut(roster);
            let before = members.len();
            for id in member_ids {
                members.remove(id);
            }
            if members.len() != before {
                room.publish_members(roster);
            }
        }
        Ok(())
    }

    async fn watch_members(&self, session_id: &str, roster: Roster) -> MemberStream {
        if let Err(e) = self.check_reachable() {
            return Self::failed_stream(e);
        }
        let mut rooms = self.rooms.write().await;
        let capacity = self.capacity;
        let room = rooms
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRoom::new(capacity));
        let current = room.members(roster).values().cloned().collect();
        Self::follow(Ok(current), room.member_tx(roster).subscribe())
    }
}
