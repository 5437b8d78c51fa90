//! Binary wire protocol between the telemetry server and a client store.
//!
//! Envelope (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────┬──────────┬─────────┬─────────┬──────────┐
//! │ msg_type │ client_id │ entity_id │ tx_id    │ version │ sent_at │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint+n  │ 16 bytes │ varint  │ varint  │ variable │
//! └──────────┴───────────┴───────────┴──────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! Payloads are JSON: a field map for `Push`/`Mutate`, live entities plus
//! deletions for `Snapshot`, UTF-8 text for a `Reject` reason. Field values are arbitrary
//! JSON, which bincode cannot describe on its own.

use floorsync_store::{EntityId, Fields, MutationRequest, ServerVersion, StoreError, TxId};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Message types for the push protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Full state, sent by the server on connect
    Snapshot = 1,
    /// New authoritative state for one entity
    Push = 2,
    /// Explicit server-side deletion
    Remove = 3,
    /// Client mutation request
    Mutate = 4,
    /// Server accepted a mutation
    Ack = 5,
    /// Server refused a mutation
    Reject = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// One authoritative entity state, as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub entity_id: EntityId,
    pub payload: Fields,
    pub server_version: ServerVersion,
    /// Milliseconds since the Unix epoch, server clock.
    pub sent_at: u64,
}

/// A deletion the server has made, carried in snapshots so a client that
/// missed the `Remove` still drops the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Removal {
    pub entity_id: EntityId,
    pub server_version: ServerVersion,
}

/// Full server state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub entities: Vec<PushMessage>,
    #[serde(default)]
    pub removed: Vec<Removal>,
}

/// Decoded server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Snapshot(SnapshotMessage),
    Push(PushMessage),
    Remove {
        entity_id: EntityId,
        server_version: ServerVersion,
    },
    Ack(TxId),
    Reject {
        tx_id: TxId,
        reason: String,
    },
    Pong,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub msg_type: MessageType,
    /// Originating client (nil for server-originated messages)
    pub client_id: Uuid,
    pub entity_id: String,
    /// Transaction id (nil when not applicable)
    pub tx_id: Uuid,
    pub server_version: u64,
    pub sent_at: u64,
    pub payload: Vec<u8>,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl WireMessage {
    fn bare(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            client_id: Uuid::nil(),
            entity_id: String::new(),
            tx_id: Uuid::nil(),
            server_version: 0,
            sent_at: 0,
            payload: Vec::new(),
        }
    }

    /// Create an authoritative push.
    pub fn push(push: &PushMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            entity_id: push.entity_id.clone(),
            server_version: push.server_version.get(),
            sent_at: push.sent_at,
            payload: to_json(&push.payload)?,
            ..Self::bare(MessageType::Push)
        })
    }

    /// Create a full-state snapshot.
    pub fn snapshot(snapshot: &SnapshotMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            sent_at: now_millis(),
            payload: to_json(snapshot)?,
            ..Self::bare(MessageType::Snapshot)
        })
    }

    /// Create an explicit deletion.
    pub fn remove(entity_id: &str, version: ServerVersion) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            server_version: version.get(),
            sent_at: now_millis(),
            ..Self::bare(MessageType::Remove)
        }
    }

    /// Create a mutation request.
    pub fn mutate(client_id: Uuid, request: &MutationRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id,
            entity_id: request.entity_id.clone(),
            tx_id: request.tx_id.as_uuid(),
            sent_at: now_millis(),
            payload: to_json(&request.patch)?,
            ..Self::bare(MessageType::Mutate)
        })
    }

    /// Create an acknowledgement for `tx_id`.
    pub fn ack(tx_id: TxId) -> Self {
        Self {
            tx_id: tx_id.as_uuid(),
            ..Self::bare(MessageType::Ack)
        }
    }

    /// Create a rejection for `tx_id`.
    pub fn reject(tx_id: TxId, reason: &str) -> Self {
        Self {
            tx_id: tx_id.as_uuid(),
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(MessageType::Reject)
        }
    }

    pub fn ping(client_id: Uuid) -> Self {
        Self {
            client_id,
            ..Self::bare(MessageType::Ping)
        }
    }

    pub fn pong() -> Self {
        Self::bare(MessageType::Pong)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn tx_id(&self) -> Option<TxId> {
        (!self.tx_id.is_nil()).then(|| TxId::from_uuid(self.tx_id))
    }

    /// Parse the field map of a `Push` or `Mutate`.
    pub fn fields(&self) -> Result<Fields, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Push | MessageType::Mutate) {
            return Err(ProtocolError::InvalidMessageType);
        }
        from_json(&self.payload)
    }

    /// Parse a `Push` into the transport-level push message.
    pub fn push_message(&self) -> Result<PushMessage, ProtocolError> {
        if self.msg_type != MessageType::Push {
            return Err(ProtocolError::InvalidMessageType);
        }
        if self.entity_id.is_empty() {
            return Err(ProtocolError::MalformedPayload("push without entity id".into()));
        }
        Ok(PushMessage {
            entity_id: self.entity_id.clone(),
            payload: self.fields()?,
            server_version: ServerVersion(self.server_version),
            sent_at: self.sent_at,
        })
    }

    /// Parse the body of a `Snapshot`.
    pub fn snapshot_body(&self) -> Result<SnapshotMessage, ProtocolError> {
        if self.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        from_json(&self.payload)
    }

    /// Parse a `Mutate` into the outbound request it carries.
    pub fn mutation_request(&self) -> Result<MutationRequest, ProtocolError> {
        if self.msg_type != MessageType::Mutate {
            return Err(ProtocolError::InvalidMessageType);
        }
        let tx_id = self
            .tx_id()
            .ok_or_else(|| ProtocolError::MalformedPayload("mutation without tx id".into()))?;
        Ok(MutationRequest {
            tx_id,
            entity_id: self.entity_id.clone(),
            patch: self.fields()?,
        })
    }

    /// Parse the reason of a `Reject`.
    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Reject {
            return Err(ProtocolError::InvalidMessageType);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
    }

    /// Convert a server-to-client message into its decoded form.
    pub fn into_inbound(self) -> Result<Inbound, ProtocolError> {
        match self.msg_type {
            MessageType::Snapshot => Ok(Inbound::Snapshot(self.snapshot_body()?)),
            MessageType::Push => Ok(Inbound::Push(self.push_message()?)),
            MessageType::Remove => Ok(Inbound::Remove {
                entity_id: self.entity_id,
                server_version: ServerVersion(self.server_version),
            }),
            MessageType::Ack => {
                let tx_id = self
                    .tx_id()
                    .ok_or_else(|| ProtocolError::MalformedPayload("ack without tx id".into()))?;
                Ok(Inbound::Ack(tx_id))
            }
            MessageType::Reject => {
                let tx_id = self
                    .tx_id()
                    .ok_or_else(|| ProtocolError::MalformedPayload("reject without tx id".into()))?;
                Ok(Inbound::Reject {
                    tx_id,
                    reason: self.reason()?,
                })
            }
            MessageType::Pong => Ok(Inbound::Pong),
            MessageType::Mutate | MessageType::Ping => Err(ProtocolError::InvalidMessageType),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    /// Envelope decoded but its payload did not.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    /// Outbound queue is at capacity.
    #[error("Outbound queue full")]
    QueueFull,
    #[error("Connection timeout")]
    Timeout,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
