//! ReplicaId: identifier of one editing session participating in a room.
//!
//! Wraps a u64 internally (it is the Loro peer id of the replica's document)
//! but displays as a 16-character hex string. The same string is published
//! as the `id` of the replica's presence state and of its operator markers.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaIdError {
    #[error("Invalid replica ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// A unique identifier for a replica in a room.
///
/// # Examples
/// ```
/// use collab_core::ReplicaId;
///
/// let parsed: ReplicaId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Generate a new random replica ID. Never returns zero or `u64::MAX`,
    /// which Loro reserves.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 && id != u64::MAX {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value (for the Loro API).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ReplicaIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(ReplicaIdError::InvalidFormat)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ReplicaId> for u64 {
    fn from(replica_id: ReplicaId) -> u64 {
        replica_id.0
    }
}

// Serialize as hex string for consistency in logs, presence and JSON payloads
impl serde::Serialize for ReplicaId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ReplicaId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_zero_padded() {
        let replica = ReplicaId(0xff);
        assert_eq!(replica.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let replica: ReplicaId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(replica.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let original = ReplicaId::generate();
        let parsed: ReplicaId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_reject_invalid() {
        assert!("too_short".parse::<ReplicaId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<ReplicaId>().is_err());
        assert!("a1b2c3d4e5f678901".parse::<ReplicaId>().is_err());
        assert!("".parse::<ReplicaId>().is_err());
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            let id = ReplicaId::generate().as_u64();
            assert_ne!(id, 0);
            assert_ne!(id, u64::MAX);
        }
    }

    #[test]
    fn test_presence_id_field_is_hex() {
        #[derive(serde::Deserialize)]
        struct Marker {
            id: ReplicaId,
        }
        let marker: Marker = serde_json::from_str(r#"{"id": "00000000000000aa"}"#).unwrap();
        assert_eq!(marker.id, ReplicaId(0xaa));
        assert!(serde_json::from_str::<Marker>(r#"{"id": "a"}"#).is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let replica = ReplicaId(0x10);
        let json = serde_json::to_string(&replica).unwrap();
        assert_eq!(json, "\"0000000000000010\"");
        let parsed: ReplicaId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, replica);
    }
}
