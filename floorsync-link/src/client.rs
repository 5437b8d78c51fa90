//! WebSocket client that feeds one [`StoreHandle`] from the push server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Inbound dispatch: snapshot, push, remove, ack and reject into the store
//! - Optimistic submit: the edit is visible locally before it is sent
//! - Outbound queue for mutations issued while disconnected

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use floorsync_store::{Fields, MutationRequest, MutationStatus, StoreError, StoreHandle, TxId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Inbound, ProtocolError, WireMessage};

/// Rejection reason for a mutation that could not be queued.
pub const QUEUE_FULL_REASON: &str = "outbound queue full";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    /// Mutations held while disconnected
    pub outbound_capacity: usize,
    /// Buffered lifecycle events
    pub event_capacity: usize,
    /// Period of the expiry sweep
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            outbound_capacity: 1024,
            event_capacity: 256,
            sweep_interval: Duration::from_millis(250),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            outbound_capacity: 8,
            event_capacity: 64,
            sweep_interval: Duration::from_millis(20),
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection lifecycle events. View changes are delivered by the store's
/// own subscriptions, not here.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// Snapshot applied: `applied` of `offered` entities were newer and
    /// `removed` entities were deleted.
    SnapshotApplied {
        offered: usize,
        applied: usize,
        removed: usize,
    },
    /// Queued mutations sent after (re)connecting
    Replayed(usize),
    Pong,
}

/// Mutation requests issued while disconnected.
pub struct OutboundQueue {
    queue: VecDeque<MutationRequest>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full.
    pub fn enqueue(&mut self, request: MutationRequest) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(request);
        true
    }

    pub fn drain(&mut self) -> Vec<MutationRequest> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Apply one decoded server message to the store.
pub fn dispatch_inbound(store: &StoreHandle, inbound: Inbound) -> Option<LinkEvent> {
    match inbound {
        Inbound::Snapshot(snapshot) => {
            let offered = snapshot.entities.len();
            let (applied, removed) = store.with(|store| {
                let applied = store.replace_snapshot(
                    snapshot
                        .entities
                        .into_iter()
                        .map(|p| (p.entity_id, p.payload, p.server_version)),
                );
                let removed = snapshot
                    .removed
                    .iter()
                    .filter(|r| store.remove_entity(&r.entity_id, r.server_version).is_applied())
                    .count();
                (applied, removed)
            });
            log::info!("Snapshot applied: {applied}/{offered} entities, {removed} removed");
            Some(LinkEvent::SnapshotApplied { offered, applied, removed })
        }
        Inbound::Push(push) => {
            let outcome =
                store.apply_server_update(&push.entity_id, push.payload, push.server_version);
            log::trace!("Push {} at {}: {outcome:?}", push.entity_id, push.server_version);
            None
        }
        Inbound::Remove { entity_id, server_version } => {
            store.remove_entity(&entity_id, server_version);
            None
        }
        Inbound::Ack(tx_id) => {
            if let Err(e) = store.confirm_mutation(tx_id) {
                log::error!("Ack for {tx_id} failed: {e}");
            }
            None
        }
        Inbound::Reject { tx_id, reason } => {
            if let Err(e) = store.reject_mutation(tx_id, reason) {
                log::error!("Reject for {tx_id} failed: {e}");
            }
            None
        }
        Inbound::Pong => Some(LinkEvent::Pong),
    }
}

/// Decode one binary frame and dispatch it. Undecodable frames are counted
/// and dropped; they never reach the authoritative layer.
pub fn dispatch_frame(store: &StoreHandle, bytes: &[u8]) -> Option<LinkEvent> {
    match WireMessage::decode(bytes).and_then(WireMessage::into_inbound) {
        Ok(inbound) => dispatch_inbound(store, inbound),
        Err(e) => {
            log::warn!("Dropping malformed frame ({} bytes): {e}", bytes.len());
            store.note_malformed();
            None
        }
    }
}

/// The link client. One per store session.
pub struct LinkClient {
    client_id: Uuid,
    config: ClientConfig,
    store: StoreHandle,

    state: Arc<RwLock<ConnectionState>>,
    /// Bumped on every connect/disconnect so a stale reader task cannot
    /// overwrite the state of a newer connection.
    epoch: Arc<AtomicU64>,

    outbound: Arc<Mutex<OutboundQueue>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    event_rx: Option<mpsc::Receiver<LinkEvent>>,
    event_tx: mpsc::Sender<LinkEvent>,
}

impl LinkClient {
    pub fn new(store: StoreHandle, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            client_id: Uuid::new_v4(),
            outbound: Arc::new(Mutex::new(OutboundQueue::new(config.outbound_capacity))),
            config,
            store,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            epoch: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server and replay queued mutations.
    ///
    /// Spawns a writer task and a reader task. The reader dispatches every
    /// inbound frame into the store.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let ws_stream = match tokio_tungstenite::connect_async(&self.config.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outbound_capacity.max(1));
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let store = self.store.clone();
        let state = self.state.clone();
        let current_epoch = self.epoch.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if let Some(event) = dispatch_frame(&store, &data) {
                            emit(&event_tx, event);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Disconnected from server");
            let mut state = state.write().await;
            if current_epoch.load(Ordering::SeqCst) == epoch {
                *state = ConnectionState::Disconnected;
                emit(&event_tx, LinkEvent::Disconnected);
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        log::info!("Client {} connected to {}", self.client_id, self.config.server_url);
        emit(&self.event_tx, LinkEvent::Connected);

        let replayed = self.replay_outbound().await?;
        if replayed > 0 {
            emit(&self.event_tx, LinkEvent::Replayed(replayed));
        }
        Ok(())
    }

    /// Close the connection. Queued and future mutations wait for the next
    /// `connect`.
    pub async fn disconnect(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        emit(&self.event_tx, LinkEvent::Disconnected);
    }

    /// Send queued requests that are still pending. Superseded or already
    /// resolved ones are dropped.
    async fn replay_outbound(&self) -> Result<usize, ProtocolError> {
        let queued = self.outbound.lock().await.drain();
        let mut replayed = 0;
        for request in queued {
            if self.store.mutation_status(request.tx_id) != Some(MutationStatus::Pending) {
                log::debug!("Skipping replay of {}: no longer pending", request.tx_id);
                continue;
            }
            self.send_request(&request).await?;
            replayed += 1;
        }
        if replayed > 0 {
            log::info!("Replayed {replayed} queued mutations");
        }
        Ok(replayed)
    }

    async fn send_request(&self, request: &MutationRequest) -> Result<(), ProtocolError> {
        let encoded = WireMessage::mutate(self.client_id, request)?.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Apply an edit optimistically and send it to the server.
    ///
    /// While disconnected the request is queued. If the queue is full the
    /// edit is rolled back at once and `QueueFull` is returned.
    pub async fn submit(&self, entity_id: &str, patch: Fields) -> Result<TxId, ProtocolError> {
        let tx_id = self.store.begin_mutation(entity_id, patch)?;
        let request = self
            .store
            .pending_request(tx_id)
            .ok_or(ProtocolError::Store(StoreError::UnknownTransaction(tx_id)))?;

        let connected = *self.state.read().await == ConnectionState::Connected;
        if connected && self.send_request(&request).await.is_ok() {
            return Ok(tx_id);
        }

        if self.outbound.lock().await.enqueue(request) {
            log::debug!("Queued {tx_id} for {entity_id} while offline");
            return Ok(tx_id);
        }

        log::warn!("Outbound queue full, rolling back {tx_id}");
        self.store.reject_mutation(tx_id, QUEUE_FULL_REASON)?;
        Err(ProtocolError::QueueFull)
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = WireMessage::ping(self.client_id).encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub async fn outbound_len(&self) -> usize {
        self.outbound.lock().await.len()
    }
}

/// Lifecycle events are advisory; a full channel must not stall dispatch.
fn emit(tx: &mpsc::Sender<LinkEvent>, event: LinkEvent) {
    if let Err(e) = tx.try_send(event) {
        log::debug!("Link event dropped: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PushMessage, Removal, SnapshotMessage};
    use floorsync_store::{FailureKind, ServerVersion, StoreConfig, StoreEvent};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn push(entity_id: &str, payload: serde_json::Value, version: u64) -> PushMessage {
        PushMessage {
            entity_id: entity_id.into(),
            payload: fields(payload),
            server_version: ServerVersion(version),
            sent_at: 0,
        }
    }

    fn offline_client(outbound_capacity: usize) -> LinkClient {
        let config = ClientConfig {
            outbound_capacity,
            ..ClientConfig::for_testing("ws://127.0.0.1:1")
        };
        LinkClient::new(StoreHandle::new(StoreConfig::for_testing()), config)
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 1024);
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_outbound_queue_capacity() {
        let mut queue = OutboundQueue::new(2);
        let req = |n: i64| MutationRequest {
            tx_id: TxId::new(),
            entity_id: "E1".into(),
            patch: fields(json!({"speed": n})),
        };

        assert!(queue.enqueue(req(1)));
        assert!(queue.enqueue(req(2)));
        assert!(!queue.enqueue(req(3)));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain();
        assert_eq!(drained[0].patch["speed"], 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dispatch_snapshot_and_push() {
        let store = StoreHandle::new(StoreConfig::for_testing());

        let snapshot = SnapshotMessage {
            entities: vec![push("E1", json!({"speed": 10}), 5), push("E2", json!({"speed": 3}), 2)],
            removed: Vec::new(),
        };
        let event = dispatch_inbound(&store, Inbound::Snapshot(snapshot));
        assert_eq!(
            event,
            Some(LinkEvent::SnapshotApplied { offered: 2, applied: 2, removed: 0 })
        );

        dispatch_inbound(&store, Inbound::Push(push("E1", json!({"speed": 11}), 6)));
        dispatch_inbound(&store, Inbound::Push(push("E1", json!({"speed": 1}), 4)));
        assert_eq!(store.view("E1").unwrap().data["speed"], 11);
        assert_eq!(store.stats().stale_updates_dropped, 1);

        let remove = Inbound::Remove { entity_id: "E2".into(), server_version: ServerVersion(7) };
        dispatch_inbound(&store, remove);
        assert!(store.view("E2").is_none());
    }

    #[test]
    fn test_dispatch_snapshot_drops_removed_entities() {
        let store = StoreHandle::new(StoreConfig::for_testing());
        store.apply_server_update("a", fields(json!({"speed": 1})), ServerVersion(1));
        store.apply_server_update("b", fields(json!({"speed": 2})), ServerVersion(2));
        let mut sub = store.subscribe();

        // `b` was deleted at v3 while this client was not listening.
        let snapshot = SnapshotMessage {
            entities: vec![push("a", json!({"speed": 1}), 1)],
            removed: vec![
                Removal { entity_id: "b".into(), server_version: ServerVersion(3) },
                Removal { entity_id: "never-seen".into(), server_version: ServerVersion(4) },
            ],
        };
        let event = dispatch_inbound(&store, Inbound::Snapshot(snapshot));

        assert_eq!(
            event,
            Some(LinkEvent::SnapshotApplied { offered: 1, applied: 0, removed: 1 })
        );
        let ids: Vec<String> = store.views().into_iter().map(|v| v.entity_id).collect();
        assert_eq!(ids, vec!["a".to_string()]);
        assert!(sub.drain().iter().any(|e| matches!(
            e,
            StoreEvent::ViewsChanged(batch) if batch.removed[..] == ["b".to_string()]
        )));

        // A late push from before either deletion changes nothing.
        dispatch_inbound(&store, Inbound::Push(push("never-seen", json!({"speed": 0}), 2)));
        assert!(store.view("never-seen").is_none());
    }

    #[test]
    fn test_dispatch_ack_and_reject() {
        let store = StoreHandle::new(StoreConfig::for_testing());
        store.apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(1));
        let mut sub = store.subscribe();

        let a = store.begin_mutation("E1", fields(json!({"speed": 12}))).unwrap();
        let b = store.begin_mutation("E1", fields(json!({"mode": "auto"}))).unwrap();

        dispatch_inbound(&store, Inbound::Ack(a));
        dispatch_inbound(&store, Inbound::Reject { tx_id: b, reason: "locked".into() });
        // Late duplicate is a no-op.
        dispatch_inbound(&store, Inbound::Ack(a));

        assert_eq!(store.mutation_status(a), Some(MutationStatus::Confirmed));
        assert_eq!(store.mutation_status(b), Some(MutationStatus::Rejected));
        let failures: Vec<_> = sub
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                StoreEvent::MutationFailed(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Rejected { reason: "locked".into() });
    }

    #[test]
    fn test_dispatch_frame_counts_malformed() {
        let store = StoreHandle::new(StoreConfig::for_testing());
        assert_eq!(dispatch_frame(&store, &[0xFF, 0x00, 0x13]), None);

        let mut bad_push = WireMessage::push(&push("E1", json!({"speed": 1}), 1)).unwrap();
        bad_push.payload = b"\"not an object\"".to_vec();
        assert_eq!(dispatch_frame(&store, &bad_push.encode().unwrap()), None);

        assert_eq!(store.stats().malformed_dropped, 2);
        assert!(store.view("E1").is_none());

        let pong = WireMessage::pong().encode().unwrap();
        assert_eq!(dispatch_frame(&store, &pong), Some(LinkEvent::Pong));
    }

    #[tokio::test]
    async fn test_submit_offline_queues() {
        let client = offline_client(8);
        client.store().apply_server_update("E1", fields(json!({"speed": 10})), ServerVersion(1));

        let tx = client.submit("E1", fields(json!({"speed": 12}))).await.unwrap();
        assert_eq!(client.outbound_len().await, 1);
        assert_eq!(client.store().view("E1").unwrap().data["speed"], 12);
        assert_eq!(client.store().mutation_status(tx), Some(MutationStatus::Pending));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_submit_queue_full_rolls_back() {
        let client = offline_client(1);
        let store = client.store().clone();
        let seed = fields(json!({"speed": 10, "mode": "manual"}));
        store.apply_server_update("E1", seed, ServerVersion(1));
        let mut sub = store.subscribe();

        client.submit("E1", fields(json!({"speed": 12}))).await.unwrap();
        let err = client.submit("E1", fields(json!({"mode": "auto"}))).await.unwrap_err();
        assert_eq!(err, ProtocolError::QueueFull);

        let view = store.view("E1").unwrap();
        assert_eq!(view.data["mode"], "manual");
        assert_eq!(view.data["speed"], 12);
        let queue_full = FailureKind::Rejected { reason: QUEUE_FULL_REASON.into() };
        assert!(sub
            .drain()
            .iter()
            .any(|e| matches!(e, StoreEvent::MutationFailed(f) if f.kind == queue_full)));
    }

    #[tokio::test]
    async fn test_submit_empty_patch_is_store_error() {
        let client = offline_client(8);
        let err = client.submit("E1", Fields::new()).await.unwrap_err();
        assert_eq!(err, ProtocolError::Store(StoreError::EmptyPatch));
        assert_eq!(client.outbound_len().await, 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let mut client = offline_client(8);
        assert_eq!(client.connect().await, Err(ProtocolError::ConnectionClosed));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.send_ping().await, Err(ProtocolError::ConnectionClosed));
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = offline_client(8);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
