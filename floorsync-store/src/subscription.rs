//! Explicit publish/subscribe list owned by the store.
//!
//! Each subscriber gets its own unbounded channel, so publishing never
//! blocks the single writer. Subscribers deregister with
//! [`SubscriberList::unsubscribe`]; a dropped receiver is removed on the
//! next publish.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::MutationFailure;
use crate::types::{EntityId, ViewRecord};

pub type SubscriptionId = u64;

/// Recomputed views for the entities whose merge inputs changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewBatch {
    pub updated: Arc<[ViewRecord]>,
    /// Entities that were rendered before and no longer are.
    pub removed: Arc<[EntityId]>,
}

impl ViewBatch {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&ViewRecord> {
        self.updated.iter().find(|v| v.entity_id == entity_id)
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ViewsChanged(ViewBatch),
    /// An optimistic edit was rolled back. Always followed by a
    /// `ViewsChanged` carrying the reverted view.
    MutationFailed(MutationFailure),
}

/// Receiving end handed to a consumer.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<StoreEvent>,
}

impl Subscription {
    /// Drain every event already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.receiver.recv().await
    }
}

#[derive(Debug, Default)]
pub struct SubscriberList {
    next_id: SubscriptionId,
    senders: HashMap<SubscriptionId, mpsc::UnboundedSender<StoreEvent>>,
}

impl SubscriberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.senders.insert(id, tx);
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.senders.remove(&id).is_some()
    }

    /// Deliver `event` to every live subscriber. Returns the delivery count.
    pub fn publish(&mut self, event: &StoreEvent) -> usize {
        let mut closed = Vec::new();
        for (id, tx) in &self.senders {
            if tx.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }
        for id in &closed {
            log::debug!("Dropping closed subscriber {id}");
            self.senders.remove(id);
        }
        self.senders.len()
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_batch() -> StoreEvent {
        StoreEvent::ViewsChanged(ViewBatch {
            updated: Arc::from(Vec::new()),
            removed: Arc::from(vec!["E1".to_string()]),
        })
    }

    #[test]
    fn test_subscribe_and_publish() {
        let mut list = SubscriberList::new();
        let mut a = list.subscribe();
        let mut b = list.subscribe();
        assert_ne!(a.id, b.id);

        assert_eq!(list.publish(&empty_batch()), 2);
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut list = SubscriberList::new();
        let mut a = list.subscribe();

        assert!(list.unsubscribe(a.id));
        assert!(!list.unsubscribe(a.id));
        assert_eq!(list.publish(&empty_batch()), 0);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_dropped_receiver_pruned() {
        let mut list = SubscriberList::new();
        let a = list.subscribe();
        let _b = list.subscribe();
        drop(a);

        assert_eq!(list.publish(&empty_batch()), 1);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_batch_lookup() {
        let batch = ViewBatch {
            updated: Arc::from(Vec::new()),
            removed: Arc::from(Vec::new()),
        };
        assert!(batch.is_empty());
        assert!(batch.get("E1").is_none());
    }
}
