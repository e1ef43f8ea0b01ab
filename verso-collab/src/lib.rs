//! # verso-collab - Real-time synchronization hub for Verso documents
//!
//! Relays CRDT updates and presence between the clients of a room over
//! WebSocket, keeping an authoritative replica per room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   lib0 frames       │ (transport) │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replica     │                     │ SyncHub     │
//! │ (local)     │                     │ (registry)  │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Room          │
//!                                    │ doc+presence  │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Binary wire protocol (sync and awareness frames)
//! - [`awareness`] - Per-room presence with clock-based merging
//! - [`connection`] - Connection ids and bounded outbound queues
//! - [`room`] - One document, its connections and fan-out
//! - [`hub`] - Room registry and connection lifecycle
//! - [`liveness`] - Ping/pong heartbeat supervision
//! - [`server`] - WebSocket transport
//! - [`client`] - WebSocket sync client

pub mod awareness;
pub mod client;
pub mod connection;
pub mod hub;
pub mod liveness;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use awareness::{AwarenessChange, AwarenessEntry, AwarenessTracker};
pub use client::{ClientError, ConnectionState, SyncClient, SyncEvent, UpdateSink};
pub use connection::{ConnectionHandle, ConnectionId, Outbound, SendError};
pub use hub::{HubConfig, HubError, HubEvent, HubStats, HubStatsSnapshot, SyncHub};
pub use liveness::{spawn_monitor, Liveness, Probe};
pub use protocol::{
    AwarenessRecord, AwarenessUpdate, ClientId, Frame, MessageType, ProtocolError, SyncMessage,
};
pub use room::{Delivery, Room};
pub use server::{room_name_from_path, ServerConfig, ServerError, SyncServer};
