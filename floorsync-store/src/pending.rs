//! Pending mutation layer: in-flight optimistic edits keyed by `txId`.
//!
//! ```text
//!            begin()
//!               │
//!               ▼
//!          ┌─────────┐  confirm()   ┌───────────┐
//!          │ Pending │ ───────────► │ Confirmed │
//!          └────┬────┘              └───────────┘
//!               │ reject()          ┌───────────┐
//!               ├─────────────────► │ Rejected  │
//!               │ expire_due()      ┌───────────┐
//!               └─ or superseded ─► │ Expired   │
//!                                   └───────────┘
//! ```
//!
//! Terminal mutations stay in the table until the next write prunes them
//! into a bounded ledger of retired ids.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreError;
use crate::types::{EntityId, Fields, MutationStatus, PendingMutation, ServerVersion, TxId};

/// Outcome of a confirm/reject call against a known transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The mutation left `Pending`; its entity needs a new view.
    Resolved { entity_id: EntityId },
    /// The mutation had already reached a terminal state.
    AlreadyTerminal(MutationStatus),
}

/// Result of starting a new mutation.
#[derive(Debug, Clone)]
pub struct Begun {
    pub tx_id: TxId,
    /// Older pending mutations this one replaced.
    pub superseded: Vec<TxId>,
}

#[derive(Debug)]
pub struct PendingLayer {
    mutations: HashMap<TxId, PendingMutation>,
    /// Per-entity ids in creation order.
    by_entity: HashMap<EntityId, Vec<TxId>>,
    retired: HashMap<TxId, MutationStatus>,
    retired_order: VecDeque<TxId>,
    retired_capacity: usize,
    next_seq: u64,
    dirty: HashSet<EntityId>,
}

impl PendingLayer {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            mutations: HashMap::new(),
            by_entity: HashMap::new(),
            retired: HashMap::new(),
            retired_order: VecDeque::with_capacity(retired_capacity.min(1024)),
            retired_capacity,
            next_seq: 0,
            dirty: HashSet::new(),
        }
    }

    /// Record a new optimistic edit.
    ///
    /// Any pending mutation on the same entity whose fields are all covered
    /// by `patch` is marked `Expired` before the new one is inserted.
    pub fn begin(
        &mut self,
        entity_id: &str,
        patch: Fields,
        base_version: ServerVersion,
        now: Instant,
        timeout: Duration,
    ) -> Begun {
        self.prune_terminal();

        let new_fields: BTreeSet<&str> = patch.keys().map(String::as_str).collect();
        let mut superseded = Vec::new();
        if let Some(ids) = self.by_entity.get(entity_id) {
            for tx_id in ids {
                if let Some(existing) = self.mutations.get_mut(tx_id) {
                    if existing.is_pending() && existing.field_set().is_subset(&new_fields) {
                        existing.status = MutationStatus::Expired;
                        superseded.push(*tx_id);
                    }
                }
            }
        }

        let tx_id = TxId::new();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.mutations.insert(
            tx_id,
            PendingMutation {
                tx_id,
                entity_id: entity_id.to_string(),
                patch: Arc::new(patch),
                base_version,
                status: MutationStatus::Pending,
                created_at: now,
                expires_at: now + timeout,
                seq,
            },
        );
        self.by_entity
            .entry(entity_id.to_string())
            .or_default()
            .push(tx_id);
        self.dirty.insert(entity_id.to_string());

        Begun { tx_id, superseded }
    }

    pub fn confirm(&mut self, tx_id: TxId) -> Result<Resolution, StoreError> {
        self.transition(tx_id, MutationStatus::Confirmed)
    }

    pub fn reject(&mut self, tx_id: TxId) -> Result<Resolution, StoreError> {
        self.transition(tx_id, MutationStatus::Rejected)
    }

    fn transition(&mut self, tx_id: TxId, to: MutationStatus) -> Result<Resolution, StoreError> {
        if let Some(mutation) = self.mutations.get_mut(&tx_id) {
            if mutation.status.is_terminal() {
                return Ok(Resolution::AlreadyTerminal(mutation.status));
            }
            mutation.status = to;
            self.dirty.insert(mutation.entity_id.clone());
            return Ok(Resolution::Resolved {
                entity_id: mutation.entity_id.clone(),
            });
        }

        match self.retired.get(&tx_id) {
            Some(status) => Ok(Resolution::AlreadyTerminal(*status)),
            None => Err(StoreError::UnknownTransaction(tx_id)),
        }
    }

    /// Confirm every pending mutation on `entity_id` that the new server
    /// state already reflects. Handles servers that broadcast results
    /// without echoing the `txId`.
    pub fn confirm_reflected(
        &mut self,
        entity_id: &str,
        version: ServerVersion,
        payload: &Fields,
    ) -> Vec<TxId> {
        let Some(ids) = self.by_entity.get(entity_id) else {
            return Vec::new();
        };

        let mut confirmed = Vec::new();
        for tx_id in ids {
            if let Some(mutation) = self.mutations.get_mut(tx_id) {
                if mutation.is_pending()
                    && version >= mutation.base_version
                    && mutation.is_reflected_in(payload)
                {
                    mutation.status = MutationStatus::Confirmed;
                    confirmed.push(*tx_id);
                }
            }
        }
        if !confirmed.is_empty() {
            self.dirty.insert(entity_id.to_string());
        }
        confirmed
    }

    /// Mark every pending mutation whose deadline has passed as `Expired`.
    pub fn expire_due(&mut self, now: Instant) -> Vec<(TxId, EntityId)> {
        let mut expired: Vec<&mut PendingMutation> = self
            .mutations
            .values_mut()
            .filter(|m| m.is_pending() && m.expires_at <= now)
            .collect();
        expired.sort_by_key(|m| m.order_key());

        let mut out = Vec::with_capacity(expired.len());
        for mutation in expired {
            mutation.status = MutationStatus::Expired;
            self.dirty.insert(mutation.entity_id.clone());
            out.push((mutation.tx_id, mutation.entity_id.clone()));
        }
        out
    }

    /// Ids of all still-pending mutations on `entity_id`, creation order.
    pub fn pending_ids_for(&self, entity_id: &str) -> Vec<TxId> {
        self.pending_for(entity_id).iter().map(|m| m.tx_id).collect()
    }

    /// Still-pending mutations on `entity_id`, sorted by creation.
    pub fn pending_for(&self, entity_id: &str) -> Vec<&PendingMutation> {
        let mut active: Vec<&PendingMutation> = self
            .by_entity
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter_map(|tx_id| self.mutations.get(tx_id))
            .filter(|m| m.is_pending())
            .collect();
        active.sort_by_key(|m| m.order_key());
        active
    }

    /// Every mutation on `entity_id` still in the table, any status.
    pub fn mutations_for<'a>(
        &'a self,
        entity_id: &str,
    ) -> impl Iterator<Item = &'a PendingMutation> + 'a {
        self.by_entity
            .get(entity_id)
            .into_iter()
            .flatten()
            .filter_map(|tx_id| self.mutations.get(tx_id))
    }

    pub fn get(&self, tx_id: TxId) -> Option<&PendingMutation> {
        self.mutations.get(&tx_id)
    }

    /// Status of a live or retired transaction.
    pub fn status(&self, tx_id: TxId) -> Option<MutationStatus> {
        self.mutations
            .get(&tx_id)
            .map(|m| m.status)
            .or_else(|| self.retired.get(&tx_id).copied())
    }

    pub fn pending_count(&self) -> usize {
        self.mutations.values().filter(|m| m.is_pending()).count()
    }

    /// Mutations in the table, including terminal ones not yet pruned.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Move terminal mutations into the retired ledger.
    pub fn prune_terminal(&mut self) -> usize {
        let terminal: Vec<TxId> = self
            .mutations
            .values()
            .filter(|m| m.status.is_terminal())
            .map(|m| m.tx_id)
            .collect();

        for tx_id in &terminal {
            if let Some(mutation) = self.mutations.remove(tx_id) {
                if let Some(ids) = self.by_entity.get_mut(&mutation.entity_id) {
                    ids.retain(|id| id != tx_id);
                    if ids.is_empty() {
                        self.by_entity.remove(&mutation.entity_id);
                    }
                }
                self.retire(*tx_id, mutation.status);
            }
        }
        terminal.len()
    }

    fn retire(&mut self, tx_id: TxId, status: MutationStatus) {
        if self.retired_capacity == 0 {
            return;
        }
        while self.retired_order.len() >= self.retired_capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(tx_id, status);
        self.retired_order.push_back(tx_id);
    }

    /// Entities whose pending set changed since the last call.
    pub fn take_dirty(&mut self) -> HashSet<EntityId> {
        std::mem::take(&mut self.dirty)
    }
}
