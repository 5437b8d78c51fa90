//! Store errors and user-visible mutation failures.
//!
//! Two separate families:
//! - [`StoreError`]: wiring bugs. Returned as `Err` from the coordinator.
//! - [`MutationFailure`]: runtime outcomes (server rejection, timeout) that
//!   roll back an optimistic overlay and are published to subscribers.
//!
//! Stale updates are neither; they are reported as
//! [`ApplyOutcome::Stale`](crate::authoritative::ApplyOutcome) and counted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EntityId, TxId};

/// Programmer-error conditions.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A `txId` that this store never issued (or has long forgotten).
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxId),
    /// `begin_mutation` called with no fields to change.
    #[error("Mutation patch is empty")]
    EmptyPatch,
}

/// Why an optimistic edit was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// The server refused the patch.
    Rejected { reason: String },
    /// No confirmation or rejection arrived before `expires_at`.
    TimedOut,
}

impl FailureKind {
    /// A timeout can be resubmitted as-is; a rejection needs a corrected edit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TimedOut)
    }
}

/// Rollback notification delivered on the subscription channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationFailure {
    pub tx_id: TxId,
    pub entity_id: EntityId,
    pub kind: FailureKind,
}

impl std::fmt::Display for MutationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            FailureKind::Rejected { reason } => {
                write!(f, "Mutation {} on {} rejected: {reason}", self.tx_id, self.entity_id)
            }
            FailureKind::TimedOut => {
                write!(f, "Mutation {} on {} timed out", self.tx_id, self.entity_id)
            }
        }
    }
}
