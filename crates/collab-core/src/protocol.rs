//! Room protocol: the messages a replica and a relay exchange.
//!
//! A connection is addressed to one room (`<server_url>/<room>`), so
//! messages carry no room name. The handshake is two steps in each
//! direction:
//!
//! 1. Each side sends `SyncStep1` with its encoded version vector.
//! 2. Each side answers the other's `SyncStep1` with `SyncStep2` carrying
//!    the updates the other side is missing.
//!
//! A replica is synced once it has applied the relay's `SyncStep2`. After
//! that, document changes stream as `Update` and presence as `Awareness`.

use crate::presence::AwarenessUpdate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded message size (50MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Room used when none is given.
pub const DEFAULT_ROOM: &str = "x6-demo-room";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid room name: {0:?}")]
    InvalidRoom(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomMessage {
    /// Our encoded version vector; the receiver answers with `SyncStep2`.
    SyncStep1 { version: Vec<u8> },

    /// Updates the receiver of a `SyncStep1` was missing.
    SyncStep2 { update: Vec<u8> },

    /// Incremental document update.
    Update { update: Vec<u8> },

    /// Presence entries.
    Awareness { update: AwarenessUpdate },

    /// Ask the receiver to send every awareness state it knows.
    QueryAwareness,
}

impl RoomMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes =
            bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            RoomMessage::SyncStep1 { .. } => "sync-step-1",
            RoomMessage::SyncStep2 { .. } => "sync-step-2",
            RoomMessage::Update { .. } => "update",
            RoomMessage::Awareness { .. } => "awareness",
            RoomMessage::QueryAwareness => "query-awareness",
        }
    }
}

/// Check a room name: non-empty, no slashes, no whitespace.
pub fn validate_room(room: &str) -> Result<&str> {
    if room.is_empty() || room.contains('/') || room.chars().any(char::is_whitespace) {
        return Err(ProtocolError::InvalidRoom(room.to_string()));
    }
    Ok(room)
}

/// Connection URL for a room.
pub fn room_url(server_url: &str, room: &str) -> Result<String> {
    let room = validate_room(room)?;
    Ok(format!("{}/{}", server_url.trim_end_matches('/'), room))
}

/// Room addressed by a request path. `/` and the empty path map to `DEFAULT_ROOM`.
pub fn room_from_path(path: &str) -> Result<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let room = path.trim_start_matches('/');
    if room.is_empty() {
        return Ok(DEFAULT_ROOM.to_string());
    }
    validate_room(room).map(str::to_string)
}
