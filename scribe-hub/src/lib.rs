//! # scribe-hub: room synchronization & broadcast hub
//!
//! Keeps a shared document per room, relays every accepted edit to the
//! other members in one agreed order, persists the resulting snapshot, and
//! tracks who is present.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ HubClient   │ ◄────────────────► │ HubServer   │
//! │ (per user)  │    Binary Proto    │ (gateway)   │
//! └─────────────┘                    └──────┬──────┘
//!                                           │ ClientMessage
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │ Hub         │ sessions, routing
//!                                    └──────┬──────┘
//!                                           │ room id
//!                                           ▼
//!                 ┌──────────────┐   ┌─────────────┐   ┌───────────────┐
//!                 │ DeltaAlgebra │ ◄─│ Room        │─► │ SnapshotWriter│
//!                 │ (compose)    │   │ (sequencer) │   │ → Store       │
//!                 └──────────────┘   └──────┬──────┘   └───────────────┘
//!                                           │ fan-out (try_send)
//!                                           ▼
//!                                      member outboxes
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded client/server messages)
//! - [`algebra`]: Edit composition capability, Yrs implementation
//! - [`broadcast`]: Per-connection outboxes and non-blocking fan-out
//! - [`registry`]: Room rosters and the room id → room map
//! - [`sequencer`]: Per-room ordering of joins, edits, saves and cursors
//! - [`session`]: Per-connection state machine
//! - [`hub`]: Connection registry and message dispatch
//! - [`storage`]: Snapshot stores and the background writer
//! - [`server`]: WebSocket gateway
//! - [`client`]: WebSocket client

pub mod protocol;
pub mod algebra;
pub mod broadcast;
pub mod registry;
pub mod sequencer;
pub mod session;
pub mod hub;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientMessage, CursorRange, ProtocolError, ServerMessage};
pub use algebra::{DeltaAlgebra, MalformedOperation, YrsAlgebra};
pub use broadcast::{BroadcastStats, Broadcaster, Delivery, FanOut, Frame, Outbox};
pub use registry::{JoinOutcome, RejoinPolicy, RoomRegistry, Roster};
pub use sequencer::{CursorKind, EditOutcome, Room};
pub use session::{Session, SessionState};
pub use hub::{Hub, HubConfig, HubStats};
pub use storage::{
    MemoryStore, PersistStats, RetryPolicy, RocksStore, RoomMetadata, SnapshotStore,
    SnapshotWriter, StoreConfig, StoreError,
};
pub use server::{HubServer, ServerConfig};
pub use client::{ClientError, ClientEvent, ConnectionState, HubClient};
