//! # floorsync-store: optimistic reconciliation core
//!
//! Merges an authoritative stream of server state with a client's
//! not-yet-confirmed edits into one consistent view per entity.
//!
//! ## Architecture
//!
//! ```text
//!  inbound push                      user edit
//!       │                                │
//!       ▼                                ▼
//! ┌──────────────────────────────────────────────────┐
//! │ Store (single writer, one dispatch per call)     │
//! │                                                  │
//! │  ┌────────────────────┐   ┌───────────────────┐  │
//! │  │ AuthoritativeLayer │   │ PendingLayer      │  │
//! │  │ version-guarded    │   │ txId → mutation   │  │
//! │  └─────────┬──────────┘   └─────────┬─────────┘  │
//! │            │ dirty                  │ dirty      │
//! │            └──────────┬─────────────┘            │
//! │                       ▼                          │
//! │                 merge_view()                     │
//! └───────────────────────┬──────────────────────────┘
//!                         ▼
//!                 SubscriberList ──► UI consumers
//! ```
//!
//! ## Modules
//!
//! - [`authoritative`]: last server-confirmed record per entity
//! - [`pending`]: in-flight optimistic mutations and their lifecycle
//! - [`merge`]: pure view derivation
//! - [`coordinator`]: the [`Store`] that owns both layers
//! - [`handle`]: shared, lock-serialized [`StoreHandle`]
//! - [`subscription`]: explicit publish/subscribe list

pub mod authoritative;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod merge;
pub mod pending;
pub mod subscription;
pub mod types;

pub use authoritative::{ApplyOutcome, AuthoritativeLayer};
pub use config::StoreConfig;
pub use coordinator::{Store, StoreStats, ENTITY_REMOVED_REASON};
pub use error::{FailureKind, MutationFailure, StoreError};
pub use handle::StoreHandle;
pub use merge::merge_view;
pub use pending::{PendingLayer, Resolution};
pub use subscription::{StoreEvent, Subscription, SubscriptionId, ViewBatch};
pub use types::{
    AuthoritativeRecord, EntityId, Fields, MutationRequest, MutationStatus, PendingMutation,
    ServerVersion, TxId, ViewRecord,
};
