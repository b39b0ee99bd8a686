//! # rally-sync: live match synchronization core
//!
//! One host device publishes authoritative match state; any number of
//! spectator devices follow it over an unreliable network.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  broadcast_state   ┌──────────────┐   merge    ┌──────────────┐
//! │ Scoreboard   │ ─────────────────► │  SyncEngine  │ ─────────► │ SessionStore │
//! │ (host)       │                    │  pending slot│            │ (remote doc) │
//! └──────────────┘                    └──────┬───────┘            └──────┬───────┘
//!                                            │ save/clear                │ watch
//!                                            ▼                           ▼
//!                                     ┌──────────────┐           ┌──────────────┐
//!                                     │ PendingQueue │           │  SyncEngine  │
//!                                     │ (RocksDB)    │           │ (spectator)  │
//!                                     └──────────────┘           └──────┬───────┘
//!                                                                       │ backoff
//!                                                                       ▼
//!                                                              ReconnectController
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: the coordinator: hosting, broadcasting, subscribing
//! - [`store`]: remote session store trait and in-memory implementation
//! - [`queue`]: durable single-slot pending queue (memory, RocksDB)
//! - [`reconnect`]: bounded exponential backoff state machine
//! - [`viewers`]: spectator and participant registries, count mirrors
//! - [`validation`]: official match rules
//! - [`sanitize`]: outbound state cleanup
//! - [`code`]: human-typable session codes
//! - [`protocol`]: session document model

pub mod code;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod sanitize;
pub mod store;
pub mod subscription;
pub mod validation;
pub mod viewers;

// Re-exports for convenience
pub use code::{generate_code, is_valid_code};
pub use config::{EngineConfig, QueueConfig, ReconnectConfig};
pub use engine::{EngineStats, MatchListener, SyncEngine};
pub use error::{QueueError, StoreError, SyncError};
pub use protocol::{
    ParticipantRecord, ParticipantRole, Roster, SessionDocument, SessionPatch, SessionProbe,
    SessionStatus, SpectatorRecord, Team,
};
pub use queue::{MemoryQueue, PendingBroadcast, PendingQueue, RocksQueue};
pub use reconnect::{ReconnectController, ReconnectDecision, ReconnectState};
pub use sanitize::{sanitize, sanitize_state};
pub use store::{MemberStream, MemoryStore, SessionStore, SnapshotStream};
pub use subscription::Subscription;
pub use validation::{validate_match, GameMode, ValidationIssue, ValidationResult, ValidationStatus};
pub use viewers::ViewerRegistry;
