//! Store coordinator: the one place both layers are written.
//!
//! Every external input goes through a `&mut self` method here. Each call
//! finishes by recomputing views for the entities marked dirty by either
//! layer and publishing them, so a subscriber never observes one layer
//! updated without the other.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use crate::authoritative::{ApplyOutcome, AuthoritativeLayer};
use crate::config::StoreConfig;
use crate::error::{FailureKind, MutationFailure, StoreError};
use crate::merge::merge_view;
use crate::pending::{PendingLayer, Resolution};
use crate::subscription::{StoreEvent, SubscriberList, Subscription, SubscriptionId, ViewBatch};
use crate::types::{
    EntityId, Fields, MutationRequest, MutationStatus, PendingMutation, ServerVersion, TxId,
    ViewRecord,
};

/// Rejection reason used when the server deletes an entity under a pending edit.
pub const ENTITY_REMOVED_REASON: &str = "entity removed";

/// Diagnostic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub updates_applied: u64,
    pub stale_updates_dropped: u64,
    pub malformed_dropped: u64,
    pub mutations_begun: u64,
    pub confirmed_explicit: u64,
    pub confirmed_implicit: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub superseded: u64,
}

/// The reconciliation store.
pub struct Store {
    config: StoreConfig,
    authoritative: AuthoritativeLayer,
    pending: PendingLayer,
    subscribers: SubscriberList,
    /// Entities included in a published batch and not since removed.
    rendered: HashSet<EntityId>,
    stats: StoreStats,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        let pending = PendingLayer::new(config.retired_capacity);
        Self {
            config,
            authoritative: AuthoritativeLayer::new(),
            pending,
            subscribers: SubscriberList::new(),
            rendered: HashSet::new(),
            stats: StoreStats::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ── Authoritative inputs ─────────────────────────────────────

    pub fn apply_server_update(
        &mut self,
        entity_id: &str,
        payload: Fields,
        version: ServerVersion,
    ) -> ApplyOutcome {
        self.apply_server_update_at(entity_id, payload, version, Instant::now())
    }

    /// Apply one push. A newer version may implicitly confirm pending
    /// mutations whose patch it already reflects.
    pub fn apply_server_update_at(
        &mut self,
        entity_id: &str,
        payload: Fields,
        version: ServerVersion,
        now: Instant,
    ) -> ApplyOutcome {
        self.pending.prune_terminal();
        let outcome = self.authoritative.apply_server_update(entity_id, payload, version, now);
        match outcome {
            ApplyOutcome::Applied => {
                self.stats.updates_applied += 1;
                self.confirm_reflected(entity_id);
            }
            ApplyOutcome::Stale | ApplyOutcome::Tombstoned => self.stats.stale_updates_dropped += 1,
        }
        self.flush(Vec::new());
        outcome
    }

    /// Bulk-load after a reconnect. Returns how many entities were applied.
    pub fn replace_snapshot<I>(&mut self, entities: I) -> usize
    where
        I: IntoIterator<Item = (EntityId, Fields, ServerVersion)>,
    {
        self.replace_snapshot_at(entities, Instant::now())
    }

    pub fn replace_snapshot_at<I>(&mut self, entities: I, now: Instant) -> usize
    where
        I: IntoIterator<Item = (EntityId, Fields, ServerVersion)>,
    {
        self.pending.prune_terminal();
        let mut offered = 0u64;
        let applied = self.authoritative.replace_snapshot(
            entities.into_iter().inspect(|_| offered += 1),
            now,
        );
        self.stats.updates_applied += applied.len() as u64;
        self.stats.stale_updates_dropped += offered - applied.len() as u64;
        for entity_id in &applied {
            self.confirm_reflected(entity_id);
        }
        log::debug!("Snapshot applied {}/{offered} entities", applied.len());
        self.flush(Vec::new());
        applied.len()
    }

    /// Explicit server deletion. Pending edits on the entity are rejected,
    /// including edits on an entity whose creating push never arrived.
    pub fn remove_entity(&mut self, entity_id: &str, version: ServerVersion) -> ApplyOutcome {
        self.pending.prune_terminal();
        let outcome = self.authoritative.remove_entity(entity_id, version);
        let mut failures = Vec::new();
        if outcome != ApplyOutcome::Stale {
            for tx_id in self.pending.pending_ids_for(entity_id) {
                if let Ok(Resolution::Resolved { entity_id }) = self.pending.reject(tx_id) {
                    self.stats.rejected += 1;
                    failures.push(MutationFailure {
                        tx_id,
                        entity_id,
                        kind: FailureKind::Rejected {
                            reason: ENTITY_REMOVED_REASON.to_string(),
                        },
                    });
                }
            }
            log::info!("Entity {entity_id} removed at {version}");
        }
        self.flush(failures);
        outcome
    }

    /// Count a payload the transport could not decode.
    pub fn note_malformed(&mut self) {
        self.stats.malformed_dropped += 1;
    }

    fn confirm_reflected(&mut self, entity_id: &str) {
        let Some(record) = self.authoritative.get(entity_id) else {
            return;
        };
        let confirmed = self
            .pending
            .confirm_reflected(entity_id, record.server_version, &record.payload);
        for tx_id in &confirmed {
            log::debug!("Mutation {tx_id} on {entity_id} confirmed by {}", record.server_version);
        }
        self.stats.confirmed_implicit += confirmed.len() as u64;
    }

    // ── Mutation lifecycle ───────────────────────────────────────

    pub fn begin_mutation(&mut self, entity_id: &str, patch: Fields) -> Result<TxId, StoreError> {
        self.begin_mutation_at(entity_id, patch, Instant::now())
    }

    /// Record an optimistic edit. The returned id is what the transport
    /// sends with the outbound request.
    pub fn begin_mutation_at(
        &mut self,
        entity_id: &str,
        patch: Fields,
        now: Instant,
    ) -> Result<TxId, StoreError> {
        if patch.is_empty() {
            return Err(StoreError::EmptyPatch);
        }
        let base_version = self.authoritative.current_version(entity_id);
        let begun = self
            .pending
            .begin(entity_id, patch, base_version, now, self.config.mutation_timeout);

        self.stats.mutations_begun += 1;
        self.stats.superseded += begun.superseded.len() as u64;
        for old in &begun.superseded {
            log::debug!("Mutation {old} on {entity_id} superseded by {}", begun.tx_id);
        }
        self.flush(Vec::new());
        Ok(begun.tx_id)
    }

    /// Explicit server acknowledgement.
    pub fn confirm_mutation(&mut self, tx_id: TxId) -> Result<(), StoreError> {
        match self.pending.confirm(tx_id) {
            Ok(Resolution::Resolved { .. }) => self.stats.confirmed_explicit += 1,
            Ok(Resolution::AlreadyTerminal(status)) => {
                log::debug!("Late ack for {tx_id}, already {status:?}");
            }
            Err(e) => {
                log::error!("Ack for a transaction this store never issued: {tx_id}");
                return Err(e);
            }
        }
        self.flush(Vec::new());
        Ok(())
    }

    /// Explicit server rejection. Rolls the overlay back and publishes a
    /// [`FailureKind::Rejected`] event.
    pub fn reject_mutation(
        &mut self,
        tx_id: TxId,
        reason: impl Into<String>,
    ) -> Result<(), StoreError> {
        let mut failures = Vec::new();
        match self.pending.reject(tx_id) {
            Ok(Resolution::Resolved { entity_id }) => {
                self.stats.rejected += 1;
                failures.push(MutationFailure {
                    tx_id,
                    entity_id,
                    kind: FailureKind::Rejected { reason: reason.into() },
                });
            }
            Ok(Resolution::AlreadyTerminal(status)) => {
                log::debug!("Late rejection for {tx_id}, already {status:?}");
            }
            Err(e) => {
                log::error!("Rejection for a transaction this store never issued: {tx_id}");
                return Err(e);
            }
        }
        self.flush(failures);
        Ok(())
    }

    /// Expire every pending edit whose deadline is at or before `now`, then
    /// prune terminal mutations. Returns how many timed out.
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let expired = self.pending.expire_due(now);
        self.stats.timed_out += expired.len() as u64;
        let failures: Vec<MutationFailure> = expired
            .into_iter()
            .map(|(tx_id, entity_id)| MutationFailure {
                tx_id,
                entity_id,
                kind: FailureKind::TimedOut,
            })
            .collect();
        let count = failures.len();
        self.pending.prune_terminal();
        self.flush(failures);
        count
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Merged view of one entity.
    pub fn view(&self, entity_id: &str) -> Option<ViewRecord> {
        merge_view(self.authoritative.get(entity_id), self.pending.mutations_for(entity_id))
    }

    /// Merged views of every renderable entity, sorted by id.
    pub fn views(&self) -> Vec<ViewRecord> {
        let ids: BTreeSet<&EntityId> = self.authoritative.entity_ids().collect();
        ids.into_iter().filter_map(|id| self.view(id)).collect()
    }

    /// Immutable copy of a mutation still in the table.
    pub fn mutation(&self, tx_id: TxId) -> Option<PendingMutation> {
        self.pending.get(tx_id).cloned()
    }

    pub fn mutation_status(&self, tx_id: TxId) -> Option<MutationStatus> {
        self.pending.status(tx_id)
    }

    /// Outbound request for a mutation that is still pending.
    pub fn pending_request(&self, tx_id: TxId) -> Option<MutationRequest> {
        self.pending
            .get(tx_id)
            .filter(|m| m.is_pending())
            .map(|m| MutationRequest {
                tx_id,
                entity_id: m.entity_id().to_string(),
                patch: m.patch().clone(),
            })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    pub fn server_version(&self, entity_id: &str) -> ServerVersion {
        self.authoritative.current_version(entity_id)
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.clone()
    }

    // ── Subscriptions ────────────────────────────────────────────

    pub fn subscribe(&mut self) -> Subscription {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publish failures, then one batch for every dirty entity.
    fn flush(&mut self, failures: Vec<MutationFailure>) {
        for failure in failures {
            log::info!("{failure}");
            self.subscribers.publish(&StoreEvent::MutationFailed(failure));
        }

        let mut dirty: Vec<EntityId> = self
            .authoritative
            .take_dirty()
            .into_iter()
            .chain(self.pending.take_dirty())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if dirty.is_empty() {
            return;
        }
        dirty.sort();

        let mut updated = Vec::new();
        let mut removed = Vec::new();
        for entity_id in dirty {
            match self.view(&entity_id) {
                Some(view) => {
                    self.rendered.insert(entity_id);
                    updated.push(view);
                }
                None => {
                    if self.rendered.remove(&entity_id) {
                        removed.push(entity_id);
                    }
                }
            }
        }

        let batch = ViewBatch {
            updated: Arc::from(updated),
            removed: Arc::from(removed),
        };
        if !batch.is_empty() {
            log::trace!(
                "Publishing {} views, {} removals",
                batch.updated.len(),
                batch.removed.len()
            );
            self.subscribers.publish(&StoreEvent::ViewsChanged(batch));
        }
    }
}
