//! Remote session store abstraction.
//!
//! The engine needs four capabilities from whatever backs a live session:
//!
//! | Capability        | Methods                                            |
//! |-------------------|----------------------------------------------------|
//! | Create/overwrite  | [`SessionStore::create`]                           |
//! | Upsert-merge      | [`SessionStore::merge`]                            |
//! | One-shot read     | [`SessionStore::get`], [`SessionStore::list_members`] |
//! | Live subscription | [`SessionStore::watch`], [`SessionStore::watch_members`] |
//!
//! Watches follow document-listener semantics: the current value is yielded
//! first, then one item per change. An `Err` item means the transport broke;
//! consumers drop the stream and resubscribe. A stream that simply ends is
//! treated the same way.

pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::StoreError;
use crate::protocol::{Roster, SessionDocument, SessionPatch};

pub use memory::MemoryStore;

/// Live view of one session document. `Ok(None)` means the document does
/// not exist (yet, or any more).
pub type SnapshotStream = BoxStream<'static, Result<Option<SessionDocument>, StoreError>>;

/// Live view of one member subcollection: every item is the full current
/// member list.
pub type MemberStream = BoxStream<'static, Result<Vec<Value>, StoreError>>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the document, replacing any existing one entirely.
    async fn create(&self, session_id: &str, doc: SessionDocument) -> Result<(), StoreError>;

    /// Upsert-merge: create if absent, otherwise write only the patch fields.
    async fn merge(&self, session_id: &str, patch: SessionPatch) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionDocument>, StoreError>;

    async fn delete(&self, session_id: &str) -> Result<(), StoreError>;

    /// Subscribe to the session document.
    async fn watch(&self, session_id: &str) -> SnapshotStream;

    /// Write `roster/{member_id}` (full overwrite of that member).
    async fn put_member(
        &self,
        session_id: &str,
        roster: Roster,
        member_id: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    async fn remove_member(
        &self,
        session_id: &str,
        roster: Roster,
        member_id: &str,
    ) -> Result<(), StoreError>;

    /// One-shot read of a subcollection as `(member_id, value)` pairs.
    async fn list_members(
        &self,
        session_id: &str,
        roster: Roster,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Delete several members in one batch.
    async fn delete_members(
        &self,
        session_id: &str,
        roster: Roster,
        member_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Subscribe to a subcollection.
    async fn watch_members(&self, session_id: &str, roster: Roster) -> MemberStream;
}
