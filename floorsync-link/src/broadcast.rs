//! Fan-out of authoritative pushes to every connected client.
//!
//! One tokio broadcast channel carries pre-encoded frames. Each client task
//! holds its own receiver; a receiver that falls more than `capacity`
//! frames behind lags and loses the oldest ones. The server answers a lag
//! with a fresh snapshot, which the version-guarded client store absorbs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, WireMessage};

/// A connected client as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientInfo {
    pub client_id: Uuid,
    pub remote_addr: String,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
}

/// Snapshot of fan-out health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub active_clients: usize,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

pub struct PushFanout {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    clients: RwLock<HashMap<Uuid, ClientInfo>>,
    capacity: usize,
    counters: Counters,
}

impl PushFanout {
    /// `capacity` frames are buffered per client before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            clients: RwLock::new(HashMap::new()),
            capacity,
            counters: Counters::default(),
        }
    }

    /// Register a client and hand back its receiver.
    pub async fn add_client(&self, info: ClientInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut clients = self.clients.write().await;
        clients.insert(info.client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_client(&self, client_id: &Uuid) -> Option<ClientInfo> {
        self.clients.write().await.remove(client_id)
    }

    /// Encode once and send to every receiver. Returns the receiver count.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(encoded))
    }

    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.counters.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.counters.frames_lagged.load(Ordering::Relaxed),
            active_clients: self.clients.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floorsync_store::ServerVersion;

    fn client(addr: &str) -> ClientInfo {
        ClientInfo {
            client_id: Uuid::new_v4(),
            remote_addr: addr.to_string(),
            connected_at: 0,
        }
    }

    #[tokio::test]
    async fn test_add_remove_client() {
        let fanout = PushFanout::new(16);
        let info = client("10.0.0.1:5000");
        let id = info.client_id;

        let _rx = fanout.add_client(info).await;
        assert_eq!(fanout.client_count().await, 1);

        let removed = fanout.remove_client(&id).await;
        assert_eq!(removed.map(|c| c.remote_addr), Some("10.0.0.1:5000".to_string()));
        assert_eq!(fanout.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let fanout = PushFanout::new(16);
        let mut rx1 = fanout.add_client(client("a")).await;
        let mut rx2 = fanout.add_client(client("b")).await;

        let msg = WireMessage::remove("line-1", ServerVersion(3));
        assert_eq!(fanout.broadcast(&msg).unwrap(), 2);

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            let decoded = WireMessage::decode(&frame).unwrap();
            assert_eq!(decoded.entity_id, "line-1");
        }
        assert_eq!(fanout.stats().await.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_broadcast_without_clients() {
        let fanout = PushFanout::new(4);
        assert_eq!(fanout.broadcast_raw(Arc::new(vec![1, 2, 3])), 0);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let fanout = PushFanout::new(2);
        let mut rx = fanout.add_client(client("slow")).await;

        for i in 0..5u8 {
            fanout.broadcast_raw(Arc::new(vec![i]));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => fanout.record_lag(n),
            other => panic!("Expected Lagged, got {other:?}"),
        }
        let stats = fanout.stats().await;
        assert_eq!(stats.frames_sent, 5);
        assert_eq!(stats.frames_lagged, 3);
        assert_eq!(stats.active_clients, 1);
    }
}
