//! # rally-relay: WebSocket gateway for live match sessions
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ RelayStore   │ ◄──────────────► │ RelayServer  │
//! │ (per device) │    WebSocket     │ (central)    │
//! └──────┬───────┘                  └──────┬───────┘
//!        │ SessionStore                    │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ SyncEngine   │                  │ MemoryStore  │
//! └──────────────┘                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: request, response, and push frames
//! - [`server`]: the relay server
//! - [`client`]: `SessionStore` over a relay connection

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::RelayStore;
pub use error::RelayError;
pub use protocol::{FaultKind, MemberEntry, RelayFault, RelayFrame, RelayOp, RelayRequest};
pub use server::{RelayConfig, RelayServer, RelayStats};
