//! Binary protocol for collection replication.
//!
//! Wire format (bincode-encoded, one websocket binary frame per message):
//! ```text
//! ┌──────────┬───────────┬────────────┬────────────┬──────────┐
//! │ msg_type │ peer_id   │ collection │ checkpoint │ payload  │
//! │ 1 byte   │ 16 bytes  │ string     │ varint     │ variable │
//! └──────────┴───────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! Session shapes:
//! ```text
//! push:  Join ─► Push ─► ... ◄─ Ack ...
//! pull:  Join ─► ◄─ Changes ... ◄─ Complete [◄─ Changes ... live]
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::StoredDoc;

/// Message types for the replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Open a session on a collection (client → server)
    Join = 1,
    /// Batch of revisions from the server's change log
    Changes = 2,
    /// Batch of revisions from the client's change log
    Push = 3,
    /// Push batch applied; checkpoint echoed
    Ack = 4,
    /// Initial catch-up of a pull session finished
    Complete = 5,
    /// Session failed; payload is a UTF-8 message
    Error = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Which way documents flow, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Local → remote
    Push,
    /// Remote → local
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("push"),
            Direction::Pull => f.write_str("pull"),
        }
    }
}

/// Payload of a `Join` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub direction: Direction,
    /// Keep the session open after the initial catch-up
    pub continuous: bool,
    /// Server sequence already seen by the client (pull only)
    pub since: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Collection the session replicates
    pub collection: String,
    /// Change sequence covered by this message (meaning depends on msg_type)
    pub checkpoint: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn bare(msg_type: MessageType, peer_id: Uuid, collection: impl Into<String>, checkpoint: u64) -> Self {
        Self {
            msg_type,
            peer_id,
            collection: collection.into(),
            checkpoint,
            payload: Vec::new(),
        }
    }

    /// Create a join message.
    pub fn join(
        peer_id: Uuid,
        collection: impl Into<String>,
        request: &JoinRequest,
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Join, peer_id, collection, request.since);
        msg.payload = encode_payload(request)?;
        Ok(msg)
    }

    /// Create a changes batch (server → client).
    pub fn changes(
        peer_id: Uuid,
        collection: impl Into<String>,
        checkpoint: u64,
        docs: &[StoredDoc],
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Changes, peer_id, collection, checkpoint);
        msg.payload = encode_payload(&docs)?;
        Ok(msg)
    }

    /// Create a push batch (client → server).
    pub fn push(
        peer_id: Uuid,
        collection: impl Into<String>,
        checkpoint: u64,
        docs: &[StoredDoc],
    ) -> Result<Self, ProtocolError> {
        let mut msg = Self::bare(MessageType::Push, peer_id, collection, checkpoint);
        msg.payload = encode_payload(&docs)?;
        Ok(msg)
    }

    pub fn ack(peer_id: Uuid, collection: impl Into<String>, checkpoint: u64) -> Self {
        Self::bare(MessageType::Ack, peer_id, collection, checkpoint)
    }

    pub fn complete(peer_id: Uuid, collection: impl Into<String>, checkpoint: u64) -> Self {
        Self::bare(MessageType::Complete, peer_id, collection, checkpoint)
    }

    pub fn error(peer_id: Uuid, collection: impl Into<String>, message: &str) -> Self {
        let mut msg = Self::bare(MessageType::Error, peer_id, collection, 0);
        msg.payload = message.as_bytes().to_vec();
        msg
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Ping, peer_id, String::new(), 0)
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Pong, peer_id, String::new(), 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect(&[MessageType::Join])?;
        decode_payload(&self.payload)
    }

    /// Parse the documents of a `Changes` or `Push` batch.
    pub fn documents(&self) -> Result<Vec<StoredDoc>, ProtocolError> {
        self.expect(&[MessageType::Changes, MessageType::Push])?;
        decode_payload(&self.payload)
    }

    /// Parse error payload.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        self.expect(&[MessageType::Error])?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn expect(&self, allowed: &[MessageType]) -> Result<(), ProtocolError> {
        if allowed.contains(&self.msg_type) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType(self.msg_type))
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Remote error: {0}")]
    Remote(String),
}
