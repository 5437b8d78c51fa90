//! Reference push server: authoritative entity table plus WebSocket fan-out.
//!
//! Architecture:
//! ```text
//! telemetry ingest ──► publish()/remove() ──┐
//!                                           ▼
//! Client A ──Mutate──► validate ──► EntityTable (global version counter)
//!     ▲                   │                 │
//!     │  Ack / Reject ◄───┘                 ▼
//!     │                               PushFanout
//!     └──────────── Push ◄──────────┬───────┴───────┐
//!                                   ▼               ▼
//!                                Client B        Client C
//! ```
//!
//! Every accepted write bumps one server-wide version counter, so versions
//! are strictly increasing per entity. A new connection gets a full
//! `Snapshot` before any incremental push, and a client that lags behind the
//! fan-out gets another one in place of the frames it missed.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use floorsync_store::{EntityId, Fields, MutationRequest, ServerVersion};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{ClientInfo, PushFanout};
use crate::protocol::{now_millis, MessageType, PushMessage, Removal, SnapshotMessage, WireMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per client before it lags
    pub broadcast_capacity: usize,
    /// Answer accepted mutations with an explicit `Ack`. When off, clients
    /// learn of acceptance only through the resulting push.
    pub echo_acks: bool,
    /// Fields clients may not write
    pub read_only_fields: HashSet<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            echo_acks: true,
            read_only_fields: HashSet::new(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            broadcast_capacity: 64,
            ..Self::default()
        }
    }

    pub fn with_read_only<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_only_fields.extend(fields.into_iter().map(Into::into));
        self
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub mutations_accepted: u64,
    pub mutations_rejected: u64,
    pub pushes_published: u64,
    pub entities_removed: u64,
    /// Snapshots resent to clients that lagged behind the fan-out
    pub resyncs: u64,
}

/// Authoritative server-side state.
#[derive(Debug, Default)]
struct EntityTable {
    entities: BTreeMap<EntityId, (Fields, ServerVersion)>,
    /// Deletion version of every removed entity not since recreated.
    removed: BTreeMap<EntityId, ServerVersion>,
    version: u64,
}

impl EntityTable {
    fn next_version(&mut self) -> ServerVersion {
        self.version += 1;
        ServerVersion(self.version)
    }

    /// Merge `patch` into the entity (creating it) and return the new state.
    fn apply_patch(&mut self, entity_id: &str, patch: Fields) -> PushMessage {
        let version = self.next_version();
        self.removed.remove(entity_id);
        let (payload, current) = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| (Fields::new(), ServerVersion::ZERO));
        payload.extend(patch);
        *current = version;
        PushMessage {
            entity_id: entity_id.to_string(),
            payload: payload.clone(),
            server_version: version,
            sent_at: now_millis(),
        }
    }

    fn remove(&mut self, entity_id: &str) -> Option<ServerVersion> {
        self.entities.remove(entity_id)?;
        let version = self.next_version();
        self.removed.insert(entity_id.to_string(), version);
        Some(version)
    }

    fn validate(
        &self,
        request: &MutationRequest,
        read_only: &HashSet<String>,
    ) -> Result<(), String> {
        if !self.entities.contains_key(&request.entity_id) {
            return Err(format!("unknown entity '{}'", request.entity_id));
        }
        if request.patch.is_empty() {
            return Err("empty patch".to_string());
        }
        match request.patch.keys().find(|k| read_only.contains(k.as_str())) {
            Some(field) => Err(format!("field '{field}' is read-only")),
            None => Ok(()),
        }
    }

    fn snapshot(&self) -> SnapshotMessage {
        let sent_at = now_millis();
        let entities = self
            .entities
            .iter()
            .map(|(id, (payload, version))| PushMessage {
                entity_id: id.clone(),
                payload: payload.clone(),
                server_version: *version,
                sent_at,
            })
            .collect();
        let removed = self
            .removed
            .iter()
            .map(|(id, version)| Removal {
                entity_id: id.clone(),
                server_version: *version,
            })
            .collect();
        SnapshotMessage { entities, removed }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The push server. Clones share one table and one fan-out.
#[derive(Clone)]
pub struct PushServer {
    config: ServerConfig,
    table: Arc<RwLock<EntityTable>>,
    fanout: Arc<PushFanout>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PushServer {
    pub fn new(config: ServerConfig) -> Self {
        let fanout = Arc::new(PushFanout::new(config.broadcast_capacity));
        Self {
            config,
            table: Arc::new(RwLock::new(EntityTable::default())),
            fanout,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Ingest new telemetry for an entity and push the full state to every
    /// client.
    pub async fn publish(&self, entity_id: &str, patch: Fields) -> Result<PushMessage, BoxError> {
        let push = self.table.write().await.apply_patch(entity_id, patch);
        self.fanout.broadcast(&WireMessage::push(&push)?)?;
        self.stats.write().await.pushes_published += 1;
        log::trace!("Published {} at {}", push.entity_id, push.server_version);
        Ok(push)
    }

    /// Delete an entity. Returns the deletion version, or `None` if the
    /// entity does not exist.
    pub async fn remove(&self, entity_id: &str) -> Result<Option<ServerVersion>, BoxError> {
        let Some(version) = self.table.write().await.remove(entity_id) else {
            return Ok(None);
        };
        self.fanout.broadcast(&WireMessage::remove(entity_id, version))?;
        self.stats.write().await.entities_removed += 1;
        log::info!("Removed entity {entity_id} at {version}");
        Ok(Some(version))
    }

    pub async fn snapshot(&self) -> SnapshotMessage {
        self.table.read().await.snapshot()
    }

    async fn send_snapshot(
        &self,
        ws_sender: &mut WsSender,
        client_id: Uuid,
    ) -> Result<(), BoxError> {
        let snapshot = self.snapshot().await;
        log::debug!(
            "Sending snapshot of {} entities and {} removals to {client_id}",
            snapshot.entities.len(),
            snapshot.removed.len()
        );
        let encoded = WireMessage::snapshot(&snapshot)?.encode()?;
        ws_sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Push server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let client_id = Uuid::new_v4();
        let info = ClientInfo {
            client_id,
            remote_addr: addr.to_string(),
            connected_at: now_millis(),
        };
        // Subscribe before reading the table so no push falls in between.
        let mut broadcast_rx = self.fanout.add_client(info).await;
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Client {client_id} connected from {addr}");

        self.send_snapshot(&mut ws_sender, client_id).await?;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let wire = match WireMessage::decode(&bytes) {
                                    Ok(wire) => wire,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                match wire.msg_type {
                                    MessageType::Mutate => {
                                        for frame in self.handle_mutation(client_id, &wire).await? {
                                            ws_sender.send(Message::Binary(frame.into())).await?;
                                        }
                                    }
                                    MessageType::Ping => {
                                        let pong = WireMessage::pong().encode()?;
                                        ws_sender.send(Message::Binary(pong.into())).await?;
                                    }
                                    other => {
                                        log::debug!(
                                            "Unhandled message type from {client_id}: {other:?}"
                                        );
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = broadcast_rx.recv() => {
                        match frame {
                            Ok(data) => {
                                // Pushes caused by this client's own mutation were sent directly.
                                if let Ok(wire) = WireMessage::decode(&data) {
                                    if wire.client_id == client_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Skipped frames are gone; resend the whole table.
                                log::warn!("Client {client_id} lagged by {n} frames, resyncing");
                                self.fanout.record_lag(n);
                                self.send_snapshot(&mut ws_sender, client_id).await?;
                                self.stats.write().await.resyncs += 1;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        self.fanout.remove_client(&client_id).await;
        self.stats.write().await.active_connections -= 1;
        result
    }

    /// Validate and apply one mutation. Returns the frames owed to the
    /// submitting client, in send order.
    async fn handle_mutation(
        &self,
        client_id: Uuid,
        wire: &WireMessage,
    ) -> Result<Vec<Vec<u8>>, BoxError> {
        let request = match wire.mutation_request() {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Malformed mutation from {client_id}: {e}");
                return Ok(match wire.tx_id() {
                    Some(tx_id) => vec![WireMessage::reject(tx_id, &e.to_string()).encode()?],
                    None => Vec::new(),
                });
            }
        };

        let validated = {
            let mut table = self.table.write().await;
            table
                .validate(&request, &self.config.read_only_fields)
                .map(|()| table.apply_patch(&request.entity_id, request.patch.clone()))
        };

        match validated {
            Ok(push) => {
                self.stats.write().await.mutations_accepted += 1;
                log::debug!(
                    "Accepted {} on {} at {}",
                    request.tx_id,
                    request.entity_id,
                    push.server_version
                );

                let mut wire_push = WireMessage::push(&push)?;
                wire_push.client_id = client_id;
                let encoded = Arc::new(wire_push.encode()?);
                self.fanout.broadcast_raw(encoded.clone());

                let mut frames = vec![encoded.to_vec()];
                if self.config.echo_acks {
                    frames.push(WireMessage::ack(request.tx_id).encode()?);
                }
                Ok(frames)
            }
            Err(reason) => {
                self.stats.write().await.mutations_rejected += 1;
                log::info!("Rejected {} on {}: {reason}", request.tx_id, request.entity_id);
                Ok(vec![WireMessage::reject(request.tx_id, &reason).encode()?])
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn fanout(&self) -> &Arc<PushFanout> {
        &self.fanout
    }
}
