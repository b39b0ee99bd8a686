//! Durable single-slot queue for the pending outbound broadcast.
//!
//! ```text
//!  broadcast_state(S1) ─┐
//!  broadcast_state(S2) ─┼──► [ slot: {session, S3} ] ──► flush ──► store
//!  broadcast_state(S3) ─┘          │
//!                                  └──► PendingQueue (survives restart)
//! ```
//!
//! The slot is overwritten on every broadcast and cleared after a successful
//! flush, so durable storage never holds more than one record.

pub mod rocks;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

use crate::error::QueueError;

pub use rocks::RocksQueue;

/// The latest state waiting to reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBroadcast {
    pub session_id: String,
    pub state: Value,
}

impl PendingBroadcast {
    pub fn new(session_id: impl Into<String>, state: Value) -> Self {
        Self {
            session_id: session_id.into(),
            state,
        }
    }
}

/// Persistence for the pending slot.
///
/// Calls are synchronous and short; the engine runs them on the blocking
/// pool from a single writer task so saves and clears land in call order.
pub trait PendingQueue: Send + Sync {
    /// Read the persisted record, if any.
    fn load(&self) -> Result<Option<PendingBroadcast>, QueueError>;

    /// Replace the persisted record.
    fn save(&self, pending: &PendingBroadcast) -> Result<(), QueueError>;

    /// Remove the persisted record.
    fn clear(&self) -> Result<(), QueueError>;
}

/// Process-local queue. Survives nothing, which is what tests and
/// persistence-less embeddings want.
#[derive(Default)]
pub struct MemoryQueue {
    slot: Mutex<Option<PendingBroadcast>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a record already "persisted", as if left by a previous run.
    pub fn with_record(pending: PendingBroadcast) -> Self {
        Self {
            slot: Mutex::new(Some(pending)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<PendingBroadcast>>, QueueError> {
        self.slot
            .lock()
            .map_err(|_| QueueError::Database("queue mutex poisoned".into()))
    }
}

impl PendingQueue for MemoryQueue {
    fn load(&self) -> Result<Option<PendingBroadcast>, QueueError> {
        Ok(self.lock()?.clone())
    }

    fn save(&self, pending: &PendingBroadcast) -> Result<(), QueueError> {
        *self.lock()? = Some(pending.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), QueueError> {
        *self.lock()? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_queue_single_slot() {
        let queue = MemoryQueue::new();
        assert!(queue.load().unwrap().is_none());

        queue.save(&PendingBroadcast::new("A", json!(1))).unwrap();
        queue.save(&PendingBroadcast::new("A", json!(2))).unwrap();
        assert_eq!(
            queue.load().unwrap(),
            Some(PendingBroadcast::new("A", json!(2)))
        );

        queue.clear().unwrap();
        assert!(queue.load().unwrap().is_none());
    }

    #[test]
    fn test_pending_wire_names() {
        let value = serde_json::to_value(PendingBroadcast::new("ABC12", json!({}))).unwrap();
        assert_eq!(value["sessionId"], "ABC12");
    }
}
