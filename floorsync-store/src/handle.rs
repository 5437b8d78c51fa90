//! Cloneable, thread-safe handle to one [`Store`].
//!
//! The handle is the serialized dispatch point shared by the transport
//! reader, the expiry sweeper and UI code. Every call takes the lock for the
//! duration of one synchronous store operation; nothing awaits while holding
//! it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::authoritative::ApplyOutcome;
use crate::config::StoreConfig;
use crate::coordinator::{Store, StoreStats};
use crate::error::StoreError;
use crate::subscription::{Subscription, SubscriptionId};
use crate::types::{
    EntityId, Fields, MutationRequest, MutationStatus, ServerVersion, TxId, ViewRecord,
};

#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(config: StoreConfig) -> Self {
        Self::from_store(Store::new(config))
    }

    pub fn from_store(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        // Store operations leave no partial writes behind on panic.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run several operations under one lock acquisition.
    pub fn with<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn apply_server_update(
        &self,
        entity_id: &str,
        payload: Fields,
        version: ServerVersion,
    ) -> ApplyOutcome {
        self.lock().apply_server_update(entity_id, payload, version)
    }

    pub fn replace_snapshot(&self, entities: Vec<(EntityId, Fields, ServerVersion)>) -> usize {
        self.lock().replace_snapshot(entities)
    }

    pub fn remove_entity(&self, entity_id: &str, version: ServerVersion) -> ApplyOutcome {
        self.lock().remove_entity(entity_id, version)
    }

    pub fn note_malformed(&self) {
        self.lock().note_malformed();
    }

    pub fn begin_mutation(&self, entity_id: &str, patch: Fields) -> Result<TxId, StoreError> {
        self.lock().begin_mutation(entity_id, patch)
    }

    pub fn confirm_mutation(&self, tx_id: TxId) -> Result<(), StoreError> {
        self.lock().confirm_mutation(tx_id)
    }

    pub fn reject_mutation(
        &self,
        tx_id: TxId,
        reason: impl Into<String>,
    ) -> Result<(), StoreError> {
        self.lock().reject_mutation(tx_id, reason)
    }

    pub fn prune_expired(&self, now: Instant) -> usize {
        self.lock().prune_expired(now)
    }

    pub fn view(&self, entity_id: &str) -> Option<ViewRecord> {
        self.lock().view(entity_id)
    }

    pub fn views(&self) -> Vec<ViewRecord> {
        self.lock().views()
    }

    pub fn mutation_status(&self, tx_id: TxId) -> Option<MutationStatus> {
        self.lock().mutation_status(tx_id)
    }

    pub fn pending_request(&self, tx_id: TxId) -> Option<MutationRequest> {
        self.lock().pending_request(tx_id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_count()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats()
    }

    pub fn subscribe(&self) -> Subscription {
        self.lock().subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_clones_share_state() {
        let handle = StoreHandle::new(StoreConfig::for_testing());
        let other = handle.clone();

        handle.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(1));
        assert_eq!(other.view("E1").unwrap().data["speed"], 10);
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let handle = StoreHandle::new(StoreConfig::for_testing());
        handle.apply_server_update("E1", fields(json!({"speed": 0})), ServerVersion(1));

        let pusher = {
            let handle = handle.clone();
            thread::spawn(move || {
                for v in 2..=200u64 {
                    handle.apply_server_update("E1", fields(json!({"speed": v})), ServerVersion(v));
                }
            })
        };
        let editor = {
            let handle = handle.clone();
            thread::spawn(move || {
                (0..100)
                    .map(|i| handle.begin_mutation("E1", fields(json!({"mode": i}))).unwrap())
                    .last()
            })
        };

        pusher.join().unwrap();
        let last_tx = editor.join().unwrap().unwrap();

        let view = handle.view("E1").unwrap();
        assert_eq!(view.data["speed"], 200);
        assert_eq!(view.data["mode"], 99);
        assert_eq!(handle.mutation_status(last_tx), Some(MutationStatus::Pending));
        assert_eq!(handle.pending_count(), 1);
    }

    #[test]
    fn test_with_batches_operations() {
        let handle = StoreHandle::new(StoreConfig::for_testing());
        let tx = handle.with(|store| {
            store.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(1));
            store.begin_mutation("E1", fields(json!({"speed": 11})))
        });
        assert!(tx.is_ok());
        assert!(handle.view("E1").unwrap().has_pending_changes);
    }
}
