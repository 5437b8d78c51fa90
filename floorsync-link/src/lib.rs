//! # floorsync-link: WebSocket transport for floorsync stores
//!
//! Connects a [`floorsync_store::StoreHandle`] to a push server and ships
//! a reference server for tests and simulation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ LinkClient   │ ◄────────────────► │ PushServer   │
//! │ (per store)  │    Binary Proto    │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │ dispatch_inbound                  │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ StoreHandle  │ ◄── expiry sweep   │ EntityTable  │
//! │ (optimistic) │                    │ (authority)  │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ PushFanout    │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode envelope with JSON payloads
//! - [`broadcast`]: fan-out with lag accounting
//! - [`server`]: reference push server
//! - [`client`]: store-feeding client with outbound queue
//! - [`sweeper`]: periodic mutation expiry

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;
pub mod sweeper;

pub use broadcast::{ClientInfo, FanoutStats, PushFanout};
pub use client::{
    dispatch_frame, dispatch_inbound, ClientConfig, ConnectionState, LinkClient, LinkEvent,
    OutboundQueue, QUEUE_FULL_REASON,
};
pub use protocol::{
    now_millis, Inbound, MessageType, ProtocolError, PushMessage, Removal, SnapshotMessage,
    WireMessage,
};
pub use server::{PushServer, ServerConfig, ServerStats};
pub use sweeper::spawn_expiry_sweep;
