//! The sync engine: one coordinator per process for hosting and watching a
//! live match.
//!
//! ```text
//!  host                                           spectator
//!  ────                                           ─────────
//!  broadcast_state ──► pending slot ──► flush     subscribe_to_match
//!        │             (1 record,       │  (≤1          │
//!        │              generation)     │  in flight)   ▼
//!        ▼                              ▼          watch stream ◄── store
//!  queue writer task ──► PendingQueue   store.merge     │ error/closed
//!  (ordered, coalesced)  (durable)                      ▼
//!                                                 ReconnectController
//!                                                  retry ─► sleep ─► wait online
//!                                                  give up ─► on_error (once)
//! ```
//!
//! Host writes never block the caller: `broadcast_state` replaces the single
//! pending record, hands a copy to the queue writer, and kicks a flush when
//! online. A flush writes only the latest state and clears the slot only if
//! no newer state arrived while the write was in flight.
//!
//! The engine is cheap to clone; all clones share the same state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::code;
use crate::config::EngineConfig;
use crate::error::{StoreError, SyncError};
use crate::protocol::{
    now_millis, ParticipantRecord, Roster, SessionDocument, SessionPatch, SessionProbe,
};
use crate::queue::{PendingBroadcast, PendingQueue};
use crate::reconnect::{ReconnectController, ReconnectDecision};
use crate::sanitize::sanitize_state;
use crate::store::SessionStore;
use crate::subscription::{Liveness, Subscription};
use crate::validation::GameMode;
use crate::viewers::ViewerRegistry;

type UpdateFn = Arc<dyn Fn(Value) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(SyncError) + Send + Sync>;
type ReconnectingFn = Arc<dyn Fn(u32) + Send + Sync>;
type EndedFn = Arc<dyn Fn() + Send + Sync>;

/// Callbacks for a match subscription. Only `on_update` is required.
#[derive(Clone)]
pub struct MatchListener {
    on_update: UpdateFn,
    on_error: Option<ErrorFn>,
    on_reconnecting: Option<ReconnectingFn>,
    on_session_ended: Option<EndedFn>,
}

impl MatchListener {
    pub fn new<F>(on_update: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Self {
            on_update: Arc::new(on_update),
            on_error: None,
            on_reconnecting: None,
            on_session_ended: None,
        }
    }

    /// Called once when the reconnect budget is exhausted.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(SyncError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called with the attempt number (1-based) before each retry.
    pub fn on_reconnecting<F>(mut self, f: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_reconnecting = Some(Arc::new(f));
        self
    }

    /// Called once when the host ends the match.
    pub fn on_session_ended<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_session_ended = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for MatchListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchListener")
            .field("on_error", &self.on_error.is_some())
            .field("on_reconnecting", &self.on_reconnecting.is_some())
            .field("on_session_ended", &self.on_session_ended.is_some())
            .finish()
    }
}

/// Engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Accepted `broadcast_state` calls.
    pub broadcasts: u64,
    /// Broadcasts that replaced a record not yet written.
    pub coalesced: u64,
    /// Broadcasts refused because the session was ended.
    pub dropped: u64,
    pub flush_attempts: u64,
    pub flush_successes: u64,
    pub flush_failures: u64,
}

#[derive(Default)]
struct Counters {
    broadcasts: AtomicU64,
    coalesced: AtomicU64,
    dropped: AtomicU64,
    flush_attempts: AtomicU64,
    flush_successes: AtomicU64,
    flush_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flush_attempts: self.flush_attempts.load(Ordering::Relaxed),
            flush_successes: self.flush_successes.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// The in-memory pending record and the generation that produced it.
#[derive(Debug, Clone)]
struct PendingSlot {
    broadcast: PendingBroadcast,
    generation: u64,
}

/// Work for the queue writer task.
enum QueueOp {
    Save(PendingBroadcast),
    Clear,
    Barrier(oneshot::Sender<()>),
}

struct EngineInner {
    store: Arc<dyn SessionStore>,
    viewers: ViewerRegistry,
    config: EngineConfig,
    runtime: Handle,

    online: watch::Sender<bool>,
    pending: Mutex<Option<PendingSlot>>,
    generation: AtomicU64,
    flushing: AtomicBool,
    queue_tx: mpsc::UnboundedSender<QueueOp>,

    match_sub: Mutex<Option<Subscription>>,
    mirrors: Mutex<HashMap<(String, Roster), Subscription>>,
    ended: Mutex<HashSet<String>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineInner {
    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn pending_slot(&self) -> Option<PendingSlot> {
        lock(&self.pending).clone()
    }

    /// Drop the pending record if it is still the one from `generation`.
    /// The durable clear is queued under the same lock as the slot change so
    /// the queue writer sees saves and clears in slot order.
    fn clear_if_generation(&self, generation: u64) -> bool {
        let mut pending = lock(&self.pending);
        match pending.as_ref() {
            Some(slot) if slot.generation == generation => {
                *pending = None;
                let _ = self.queue_tx.send(QueueOp::Clear);
                true
            }
            _ => false,
        }
    }

    fn discard_pending(&self) {
        let mut pending = lock(&self.pending);
        *pending = None;
        let _ = self.queue_tx.send(QueueOp::Clear);
    }
}

/// Live match sync engine. See the module docs for the data flow.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build the engine, start its queue writer, and recover any broadcast a
    /// previous run left in `queue`. Flushing resumes right away when online.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(
        store: Arc<dyn SessionStore>,
        queue: Arc<dyn PendingQueue>,
        config: EngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue_writer(queue.clone(), queue_rx));

        let (online, _) = watch::channel(config.start_online);
        let engine = Self {
            inner: Arc::new(EngineInner {
                viewers: ViewerRegistry::new(store.clone()),
                store,
                config,
                runtime: Handle::current(),
                online,
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                flushing: AtomicBool::new(false),
                queue_tx,
                match_sub: Mutex::new(None),
                mirrors: Mutex::new(HashMap::new()),
                ended: Mutex::new(HashSet::new()),
                counters: Counters::default(),
            }),
        };

        engine.recover(queue).await;
        engine
    }

    async fn recover(&self, queue: Arc<dyn PendingQueue>) {
        let loaded = match tokio::task::spawn_blocking(move || queue.load()).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                log::warn!("Discarding unreadable pending broadcast: {e}");
                None
            }
            Err(e) => {
                log::error!("Pending queue recovery task failed: {e}");
                None
            }
        };
        let Some(broadcast) = loaded else {
            return;
        };

        {
            let mut pending = lock(&self.inner.pending);
            if pending.is_some() {
                return;
            }
            log::info!(
                "Recovered pending broadcast for session {}",
                broadcast.session_id
            );
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *pending = Some(PendingSlot {
                broadcast,
                generation,
            });
        }
        self.kick_flush();
    }

    // ─── Connectivity ─────────────────────────────────────────────────

    pub fn is_online(&self) -> bool {
        self.inner.is_online()
    }

    /// Report a connectivity change. Going online re-triggers a flush and
    /// releases reconnect attempts waiting for the network.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.send_replace(online);
        if online && !was_online {
            log::info!("Connectivity restored");
            self.kick_flush();
        } else if !online && was_online {
            log::info!("Connectivity lost, broadcasts will be queued");
        }
    }

    // ─── Host side ────────────────────────────────────────────────────

    /// Create (or overwrite) the session document. Failures are returned,
    /// not queued.
    pub async fn host_match(
        &self,
        session_id: &str,
        host_uid: &str,
        initial_state: Value,
    ) -> Result<(), SyncError> {
        let doc = SessionDocument::hosted(host_uid, sanitize_state(&initial_state));
        if let Err(e) = self.inner.store.create(session_id, doc).await {
            log::error!("Failed to host match {session_id}: {e}");
            return Err(e.into());
        }

        lock(&self.inner.ended).remove(session_id);
        log::info!("Hosting match {session_id} as {host_uid}");

        if self.inner.config.mirror_on_host {
            self.start_spectator_mirror(session_id);
        }
        Ok(())
    }

    /// Replace the pending state and schedule a write. Never waits on I/O.
    pub fn broadcast_state(&self, session_id: &str, state: Value) {
        let inner = &self.inner;
        if lock(&inner.ended).contains(session_id) {
            log::warn!("Dropping broadcast for ended session {session_id}");
            Counters::bump(&inner.counters.dropped);
            return;
        }

        let broadcast = PendingBroadcast::new(session_id, sanitize_state(&state));
        {
            let mut pending = lock(&inner.pending);
            if let Some(previous) = pending.as_ref() {
                if previous.broadcast.session_id != session_id {
                    log::warn!(
                        "Broadcast for {session_id} replaces unsent state of {}",
                        previous.broadcast.session_id
                    );
                }
                Counters::bump(&inner.counters.coalesced);
            }
            let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = inner.queue_tx.send(QueueOp::Save(broadcast.clone()));
            *pending = Some(PendingSlot {
                broadcast,
                generation,
            });
        }
        Counters::bump(&inner.counters.broadcasts);

        self.kick_flush();
    }

    fn kick_flush(&self) {
        if !self.is_online() || self.inner.flushing.load(Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        self.inner.runtime.spawn(async move { engine.flush().await });
    }

    /// Write the pending state, if any. Returns immediately when another
    /// flush is already in flight.
    ///
    /// Keeps going while online and a record is pending: a failed write is
    /// retried after `flush_retry_delay`, and a state that arrived during a
    /// successful write is sent next.
    pub async fn flush(&self) {
        let inner = &self.inner;
        if inner.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            while inner.is_online() {
                let Some(slot) = inner.pending_slot() else {
                    break;
                };

                Counters::bump(&inner.counters.flush_attempts);
                let session_id = slot.broadcast.session_id.clone();
                let result = inner
                    .store
                    .merge(&session_id, SessionPatch::state(slot.broadcast.state))
                    .await;

                match result {
                    Ok(()) => {
                        Counters::bump(&inner.counters.flush_successes);
                        if inner.clear_if_generation(slot.generation) {
                            log::debug!("Flushed broadcast for {session_id}");
                        }
                    }
                    Err(StoreError::SessionFinished(_)) => {
                        log::warn!("Session {session_id} is finished, dropping pending state");
                        inner.clear_if_generation(slot.generation);
                    }
                    Err(e) => {
                        Counters::bump(&inner.counters.flush_failures);
                        log::warn!("Broadcast flush for {session_id} failed, retrying: {e}");
                        tokio::time::sleep(inner.config.flush_retry_delay).await;
                    }
                }
            }

            inner.flushing.store(false, Ordering::SeqCst);

            // A broadcast that raced the flag reset saw a flush in progress
            // and did not start its own.
            let retry = inner.is_online() && inner.pending_slot().is_some();
            if !retry || inner.flushing.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Finish the session: stop mirrors and the match subscription, mark the
    /// document finished, clear the pending record, and remove all viewers.
    pub async fn end_session(&self, session_id: &str) -> Result<(), SyncError> {
        let inner = &self.inner;
        self.stop_mirrors(session_id);
        if let Some(sub) = lock(&inner.match_sub).take() {
            sub.unsubscribe();
        }
        lock(&inner.ended).insert(session_id.to_string());

        if let Err(e) = inner.store.merge(session_id, SessionPatch::finish()).await {
            log::error!("Failed to end session {session_id}: {e}");
            lock(&inner.ended).remove(session_id);
            return Err(e.into());
        }

        inner.discard_pending();
        let spectators = inner.viewers.clear_roster(session_id, Roster::Spectators).await;
        let participants = inner
            .viewers
            .clear_roster(session_id, Roster::Participants)
            .await;
        log::info!(
            "Ended session {session_id} ({spectators} spectators, {participants} participants removed)"
        );
        Ok(())
    }

    /// Best-effort permanent delete of the session document.
    pub async fn delete_session(&self, session_id: &str) {
        match self.inner.store.delete(session_id).await {
            Ok(()) => log::info!("Deleted session {session_id}"),
            Err(e) => log::warn!("Failed to delete session {session_id}: {e}"),
        }
    }

    pub fn generate_code(&self) -> String {
        code::generate_code()
    }

    /// Copy of the record waiting to be written.
    pub fn pending(&self) -> Option<PendingBroadcast> {
        self.inner.pending_slot().map(|slot| slot.broadcast)
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::SeqCst)
    }

    /// Wait until every queue operation issued so far reached durable storage.
    pub async fn persisted(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.queue_tx.send(QueueOp::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    // ─── Viewer count mirrors ─────────────────────────────────────────

    /// Mirror `spectators + 1` into `connectedCount`. Replaces a running
    /// mirror for the same session.
    pub fn start_spectator_mirror(&self, session_id: &str) {
        let sub = self.inner.viewers.mirror_spectators(session_id);
        self.install_mirror(session_id, Roster::Spectators, sub);
    }

    pub fn stop_spectator_mirror(&self, session_id: &str) {
        self.remove_mirror(session_id, Roster::Spectators);
    }

    /// Mirror unique checked-in players and the official-match flag.
    pub fn start_participant_mirror(&self, session_id: &str, mode: GameMode) {
        let sub = self.inner.viewers.mirror_participants(session_id, mode);
        self.install_mirror(session_id, Roster::Participants, sub);
    }

    pub fn stop_participant_mirror(&self, session_id: &str) {
        self.remove_mirror(session_id, Roster::Participants);
    }

    fn install_mirror(&self, session_id: &str, roster: Roster, sub: Subscription) {
        let previous = lock(&self.inner.mirrors).insert((session_id.to_string(), roster), sub);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    fn remove_mirror(&self, session_id: &str, roster: Roster) {
        let removed = lock(&self.inner.mirrors).remove(&(session_id.to_string(), roster));
        if let Some(sub) = removed {
            sub.unsubscribe();
            log::debug!("Stopped {roster} mirror for {session_id}");
        }
    }

    fn stop_mirrors(&self, session_id: &str) {
        self.remove_mirror(session_id, Roster::Spectators);
        self.remove_mirror(session_id, Roster::Participants);
    }

    // ─── Spectator side ───────────────────────────────────────────────

    /// One-shot probe. A failed read reports `NotFound`.
    pub async fn check_session_status(&self, session_id: &str) -> SessionProbe {
        match self.inner.store.get(session_id).await {
            Ok(Some(doc)) if doc.status.is_finished() => SessionProbe::Finished,
            Ok(Some(_)) => SessionProbe::Active,
            Ok(None) => SessionProbe::NotFound,
            Err(e) => {
                log::warn!("Failed to check status of {session_id}: {e}");
                SessionProbe::NotFound
            }
        }
    }

    /// Follow a match. Any earlier match subscription of this engine is
    /// cancelled before this one starts, so callbacks never interleave.
    pub fn subscribe_to_match(&self, session_id: &str, listener: MatchListener) -> Subscription {
        let mut current = lock(&self.inner.match_sub);
        if let Some(previous) = current.take() {
            previous.unsubscribe();
            log::debug!("Replaced previous match subscription");
        }

        let inner = self.inner.clone();
        let session_id = session_id.to_string();
        log::info!("Subscribing to match {session_id}");
        let sub = Subscription::spawn(move |liveness| {
            run_match_subscription(inner, session_id, listener, liveness)
        });
        *current = Some(sub.clone());
        sub
    }

    pub async fn join_as_spectator(&self, session_id: &str, uid: &str) -> Result<(), SyncError> {
        self.inner
            .viewers
            .join_as_spectator(session_id, uid)
            .await
            .inspect_err(|e| log::error!("Failed to join {session_id} as spectator: {e}"))
            .map_err(Into::into)
    }

    pub async fn leave_spectator(&self, session_id: &str, uid: &str) -> Result<(), SyncError> {
        self.inner
            .viewers
            .leave_spectator(session_id, uid)
            .await
            .inspect_err(|e| log::error!("Failed to leave {session_id}: {e}"))
            .map_err(Into::into)
    }

    pub async fn check_in_participant(
        &self,
        session_id: &str,
        participant: &ParticipantRecord,
    ) -> Result<(), SyncError> {
        self.inner
            .viewers
            .check_in(session_id, participant)
            .await
            .inspect_err(|e| log::error!("Failed to check in to {session_id}: {e}"))
            .map_err(Into::into)
    }

    pub async fn check_out_participant(&self, session_id: &str, uid: &str) -> Result<(), SyncError> {
        self.inner
            .viewers
            .check_out(session_id, uid)
            .await
            .inspect_err(|e| log::error!("Failed to check out of {session_id}: {e}"))
            .map_err(Into::into)
    }

    pub async fn participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>, SyncError> {
        Ok(self.inner.viewers.participants(session_id).await?)
    }

    /// Live spectator count, host excluded. A subscription error reports 0.
    pub fn subscribe_to_spectator_count<F>(&self, session_id: &str, on_count: F) -> Subscription
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.inner
            .viewers
            .watch_count(session_id, Roster::Spectators, on_count)
    }

    /// Milliseconds since a host-side timestamp, never negative.
    pub fn measure_latency(&self, host_timestamp_ms: u64) -> u64 {
        now_millis().saturating_sub(host_timestamp_ms)
    }
}

/// How one watch of the session document ended.
enum WatchOutcome {
    /// Terminal: the session finished or the subscription was cancelled.
    Stopped,
    /// Reconnectable.
    Broken(StoreError),
}

async fn run_match_subscription(
    inner: Arc<EngineInner>,
    session_id: String,
    listener: MatchListener,
    liveness: Arc<Liveness>,
) {
    let mut reconnect = ReconnectController::new(inner.config.reconnect.clone());
    let mut online = inner.online.subscribe();

    loop {
        let failure =
            match follow_match(&*inner.store, &session_id, &listener, &liveness, &mut reconnect)
                .await
            {
                WatchOutcome::Stopped => return,
                WatchOutcome::Broken(e) => e,
            };
        if !liveness.is_alive() {
            return;
        }

        match reconnect.on_failure() {
            ReconnectDecision::Retry { attempt, delay } => {
                log::warn!(
                    "Match subscription to {session_id} lost ({failure}), retry {attempt} in {delay:?}"
                );
                let delivered = liveness.deliver(|| {
                    if let Some(cb) = &listener.on_reconnecting {
                        cb(attempt);
                    }
                });
                if delivered.is_none() {
                    return;
                }
                tokio::time::sleep(delay).await;

                if !*online.borrow_and_update() {
                    log::debug!("Waiting for connectivity before resubscribing to {session_id}");
                    if online.wait_for(|up| *up).await.is_err() {
                        return;
                    }
                }
            }
            ReconnectDecision::GiveUp { attempts } => {
                liveness.finish(|| {
                    log::error!("Giving up on match {session_id} after {attempts} attempts");
                    if let Some(cb) = &listener.on_error {
                        cb(SyncError::ReconnectExhausted {
                            session_id: session_id.clone(),
                            attempts,
                            source: failure,
                        });
                    }
                });
                return;
            }
        }
    }
}

async fn follow_match(
    store: &dyn SessionStore,
    session_id: &str,
    listener: &MatchListener,
    liveness: &Liveness,
    reconnect: &mut ReconnectController,
) -> WatchOutcome {
    let mut snapshots = store.watch(session_id).await;
    while let Some(event) = snapshots.next().await {
        if !liveness.is_alive() {
            return WatchOutcome::Stopped;
        }
        match event {
            Ok(None) => {
                return WatchOutcome::Broken(StoreError::NotFound(session_id.to_string()));
            }
            Ok(Some(doc)) if doc.status.is_finished() => {
                liveness.finish(|| {
                    log::info!("Match {session_id} finished");
                    if let Some(cb) = &listener.on_session_ended {
                        cb();
                    }
                });
                return WatchOutcome::Stopped;
            }
            Ok(Some(doc)) => {
                reconnect.on_success();
                if liveness.deliver(|| (listener.on_update)(doc.state)).is_none() {
                    return WatchOutcome::Stopped;
                }
            }
            Err(e) => return WatchOutcome::Broken(e),
        }
    }
    WatchOutcome::Broken(StoreError::Unavailable("watch stream closed".into()))
}

/// Apply queue operations in order. Operations that pile up while a write
/// is running collapse to the last one, since each fully replaces the slot.
async fn run_queue_writer(queue: Arc<dyn PendingQueue>, mut rx: mpsc::UnboundedReceiver<QueueOp>) {
    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut barriers = Vec::new();
        collect_op(first, &mut latest, &mut barriers);
        while let Ok(op) = rx.try_recv() {
            collect_op(op, &mut latest, &mut barriers);
        }

        if let Some(op) = latest {
            let queue = queue.clone();
            let written = tokio::task::spawn_blocking(move || match op {
                QueueOp::Save(pending) => queue.save(&pending),
                _ => queue.clear(),
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Pending queue write failed: {e}"),
                Err(e) => log::error!("Pending queue writer task failed: {e}"),
            }
        }

        for barrier in barriers {
            let _ = barrier.send(());
        }
    }
    log::debug!("Pending queue writer stopped");
}

fn collect_op(op: QueueOp, latest: &mut Option<QueueOp>, barriers: &mut Vec<oneshot::Sender<()>>) {
    match op {
        QueueOp::Barrier(tx) => barriers.push(tx),
        write => *latest = Some(write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn engine_with(store: &MemoryStore, queue: Arc<MemoryQueue>) -> SyncEngine {
        SyncEngine::start(Arc::new(store.clone()), queue, EngineConfig::for_testing()).await
    }

    #[tokio::test]
    async fn test_broadcast_persists_single_record() {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryQueue::new());
        let engine = engine_with(&store, queue.clone()).await;
        engine.set_online(false);

        for i in 0..5 {
            engine.broadcast_state("Q1", json!({"rally": i}));
        }
        engine.persisted().await;

        assert_eq!(
            queue.load().unwrap(),
            Some(PendingBroadcast::new("Q1", json!({"rally": 4})))
        );
        assert_eq!(engine.stats().coalesced, 4);
    }

    #[tokio::test]
    async fn test_broadcast_sanitizes() {
        let store = MemoryStore::new();
        let engine = engine_with(&store, Arc::new(MemoryQueue::new())).await;
        engine.set_online(false);

        engine.broadcast_state("Q2", json!({"score": 1, "lastSnapshot": {"score": 0}}));
        assert_eq!(engine.pending().unwrap().state, json!({"score": 1}));
    }

    #[tokio::test]
    async fn test_recovered_record_is_flushed() {
        let store = MemoryStore::new();
        let queue = Arc::new(MemoryQueue::with_record(PendingBroadcast::new(
            "R1",
            json!({"sets": [1, 0]}),
        )));
        let engine = engine_with(&store, queue.clone()).await;
        engine.flush().await;
        engine.persisted().await;

        assert_eq!(store.state_writes(), vec![("R1".to_string(), json!({"sets": [1, 0]}))]);
        assert!(engine.pending().is_none());
        assert!(queue.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_measure_latency_never_negative() {
        let store = MemoryStore::new();
        let engine = engine_with(&store, Arc::new(MemoryQueue::new())).await;
        assert_eq!(engine.measure_latency(now_millis() + 60_000), 0);
        assert!(engine.measure_latency(now_millis() - 250) >= 250);
    }

    #[tokio::test]
    async fn test_generated_code_shape() {
        let store = MemoryStore::new();
        let engine = engine_with(&store, Arc::new(MemoryQueue::new())).await;
        assert!(code::is_valid_code(&engine.generate_code()));
    }
}
