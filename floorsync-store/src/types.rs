//! Core value types shared by the three store layers.
//!
//! Entities are keyed by a stable string id (a production line, a machine).
//! Payloads and patches are flat JSON field maps; a patch is a partial map
//! whose keys name the fields being changed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Stable entity key.
pub type EntityId = String;

/// Structured entity payload or partial patch.
pub type Fields = serde_json::Map<String, Value>;

/// Server-assigned version. Monotonically increasing per entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerVersion(pub u64);

impl ServerVersion {
    /// Version of an entity the store has never heard of.
    pub const ZERO: ServerVersion = ServerVersion(0);

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Client-generated transaction id for one optimistic edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    /// Generate a fresh, globally unique id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last server-confirmed state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoritativeRecord {
    pub entity_id: EntityId,
    pub payload: Fields,
    pub server_version: ServerVersion,
    pub last_server_update_at: Instant,
}

/// Lifecycle of an optimistic edit. Every state except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Confirmed,
    Rejected,
    Expired,
}

impl MutationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MutationStatus::Pending)
    }
}

/// One optimistic edit.
///
/// The patch is shared behind an `Arc` and never written after creation;
/// corrections are new mutations that supersede this one. Only `status`
/// moves, and only out of `Pending`.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub(crate) tx_id: TxId,
    pub(crate) entity_id: EntityId,
    pub(crate) patch: Arc<Fields>,
    pub(crate) base_version: ServerVersion,
    pub(crate) status: MutationStatus,
    pub(crate) created_at: Instant,
    pub(crate) expires_at: Instant,
    /// Creation order within the store; breaks `created_at` ties.
    pub(crate) seq: u64,
}

impl PendingMutation {
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn patch(&self) -> &Fields {
        &self.patch
    }

    pub fn base_version(&self) -> ServerVersion {
        self.base_version
    }

    pub fn status(&self) -> MutationStatus {
        self.status
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    /// Field names this mutation touches.
    pub fn field_set(&self) -> BTreeSet<&str> {
        self.patch.keys().map(String::as_str).collect()
    }

    /// Whether every patched field already holds the patched value in `payload`.
    pub fn is_reflected_in(&self, payload: &Fields) -> bool {
        self.patch
            .iter()
            .all(|(field, value)| payload.get(field) == Some(value))
    }

    /// Merge ordering key: creation time, then creation sequence.
    pub(crate) fn order_key(&self) -> (Instant, u64) {
        (self.created_at, self.seq)
    }
}

/// Outbound request handed to the transport for one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub tx_id: TxId,
    pub entity_id: EntityId,
    pub patch: Fields,
}

/// Read-only projection of one entity for UI consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRecord {
    pub entity_id: EntityId,
    pub data: Fields,
    pub server_version: ServerVersion,
    pub has_pending_changes: bool,
    /// Sorted, de-duplicated names of fields currently overlaid.
    pub pending_field_set: Vec<String>,
}
