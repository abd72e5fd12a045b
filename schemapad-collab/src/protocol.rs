//! Room wire protocol.
//!
//! Wire format (bincode-encoded, standard config):
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ from     │ to           │ clock    │ payload  │
//! │ 1 byte   │ varint   │ 0 | 1+varint │ varint   │ variable │
//! └──────────┴──────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads are yrs v1 updates. Awareness payloads are a
//! bincode-encoded [`AwarenessUpdate`]. Selection endpoints inside a
//! [`PeerState`] are opaque relative-position bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric peer id assigned by the transport when joining a room.
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Joining peer's full state; every receiver answers with SyncStep2
    SyncStep1 = 1,
    /// Full state sent back to the joining peer
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Presence state change of the sender
    Awareness = 4,
    /// Ask every peer to rebroadcast its presence state
    AwarenessQuery = 5,
    /// Sender is leaving the room
    Leave = 6,
}

/// Selection of a peer as relative positions. `head` is where the caret
/// is, `anchor` where the selection started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSelection {
    pub anchor: Vec<u8>,
    pub head: Vec<u8>,
}

/// What a peer publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub name: String,
    /// `#rrggbb`
    pub color: String,
    pub selection: Option<PeerSelection>,
}

impl PeerState {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            selection: None,
        }
    }

    /// Remote states come from other processes and are checked before use.
    pub fn is_well_formed(&self) -> bool {
        let selection_ok = self
            .selection
            .as_ref()
            .is_none_or(|s| !s.anchor.is_empty() && !s.head.is_empty());
        !self.name.trim().is_empty() && is_hex_color(&self.color) && selection_ok
    }
}

/// `#` followed by exactly six hex digits.
pub fn is_hex_color(color: &str) -> bool {
    color
        .strip_prefix('#')
        .is_some_and(|hex| hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Awareness payload. `state: None` means the sender went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub clock: u64,
    pub state: Option<PeerState>,
}

/// Top-level room message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub from: ClientId,
    /// Addressed to one peer; `None` means everyone in the room.
    pub to: Option<ClientId>,
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn sync_step1(from: ClientId, state: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            from,
            to: None,
            clock: 0,
            payload: state,
        }
    }

    pub fn sync_step2(from: ClientId, to: ClientId, state: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            from,
            to: Some(to),
            clock: 0,
            payload: state,
        }
    }

    pub fn update(from: ClientId, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            from,
            to: None,
            clock,
            payload: update,
        }
    }

    pub fn awareness(from: ClientId, update: &AwarenessUpdate) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Awareness,
            from,
            to: None,
            clock: update.clock,
            payload,
        })
    }

    pub fn awareness_query(from: ClientId) -> Self {
        Self {
            msg_type: MessageType::AwarenessQuery,
            from,
            to: None,
            clock: 0,
            payload: Vec::new(),
        }
    }

    pub fn leave(from: ClientId) -> Self {
        Self {
            msg_type: MessageType::Leave,
            from,
            to: None,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Whether `client` should process this message: not its own and
    /// either broadcast or addressed to it.
    pub fn is_for(&self, client: ClientId) -> bool {
        self.from != client && self.to.is_none_or(|to| to == client)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn awareness_update(&self) -> Result<AwarenessUpdate, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
}
