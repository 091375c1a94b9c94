//! # ot-presence — Presence synchronization for OT documents
//!
//! Keeps ephemeral per-client state (cursors, selections) causally consistent
//! with a document that is concurrently mutated through operational
//! transformation, even when presence messages and ops arrive interleaved or
//! out of order.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  update()   ┌───────────────┐  send()   ┌────────────┐
//! │  Application  │ ──────────► │ LocalPresence │ ────────► │ Connection │
//! └───────────────┘             └───────┬───────┘           └─────┬──────┘
//!                                       │ op / create / del / load│
//!                               ┌───────┴───────┐                 │ inbound
//!                               │   Document    │                 ▼
//!                               │ (version, OT) │         ┌──────────────────┐
//!                               └───────┬───────┘         │ PresenceRegistry │
//!                                       │                 └────────┬─────────┘
//!                                       ▼                          ▼
//!                               ┌────────────────┐  catch-up ┌──────────┐
//!                               │ RemotePresence │ ◄───────► │ OpCache  │
//!                               └───────┬────────┘           └──────────┘
//!                                       │ presence(id, value)
//!                                       ▼
//!                                 document listeners
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire message, validation and acknowledgements
//! - [`document`] / [`connection`] — Collaborator interfaces
//! - [`ot`] — Presence transform capability of an OT type
//! - [`local`] — Outbound presence tracker
//! - [`remote`] — Inbound presence tracker with version reconciliation
//! - [`op_cache`] — Version-indexed op buffer used while catching up
//! - [`registry`] — Per-connection routing of trackers
//! - [`memory`] — In-process document and connection

pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod events;
pub mod local;
pub mod memory;
pub mod op_cache;
pub mod ot;
pub mod protocol;
pub mod registry;
pub mod remote;

// Re-exports for convenience
pub use config::PresenceConfig;
pub use connection::{Connection, ConnectionId};
pub use document::{AppliedOp, DocEvent, DocListener, Document, PresenceEntry, SubscriptionId};
pub use error::PresenceError;
pub use events::{Completion, Emitter, ListenerId};
pub use local::LocalPresence;
pub use memory::{MemoryConnection, MemoryDocument};
pub use op_cache::{CachedOp, OpCache};
pub use ot::{PresenceType, TextType, TransformError};
pub use protocol::{PresenceAck, PresenceMessage, ProtocolError, RawPresenceMessage, SendOptions};
pub use registry::PresenceRegistry;
pub use remote::{PresenceUpdate, RemotePresence, SyncStatus};
