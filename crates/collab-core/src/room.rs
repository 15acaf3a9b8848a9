//! RoomHub: relay-side room state, without any I/O.
//!
//! The hub keeps one document per room and the latest awareness entry of
//! every client seen in it. Each entry point takes what a connection said
//! and returns the messages to send, addressed by connection id. The
//! caller owns the sockets.

use crate::presence::{AwarenessEntry, AwarenessUpdate, ClientId, MAX_CLOCK};
use crate::protocol::{validate_room, ProtocolError, RoomMessage};
use loro::{ExportMode, LoroDoc, VersionVector};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection {0} already joined a room")]
    AlreadyJoined(ConnectionId),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Loro error: {0}")]
    Loro(String),
}

pub type Result<T> = std::result::Result<T, RoomError>;

/// A message addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: ConnectionId,
    pub message: RoomMessage,
}

impl Outgoing {
    fn new(to: ConnectionId, message: RoomMessage) -> Self {
        Self { to, message }
    }
}

struct Room {
    doc: LoroDoc,
    members: BTreeSet<ConnectionId>,
    awareness: BTreeMap<ClientId, AwarenessEntry>,
    /// Awareness clients introduced by each connection.
    owners: BTreeMap<ConnectionId, BTreeSet<ClientId>>,
}

impl Room {
    fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            members: BTreeSet::new(),
            awareness: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    fn live_awareness(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: self
                .awareness
                .values()
                .filter(|entry| entry.state.is_some())
                .cloned()
                .collect(),
        }
    }

    fn broadcast(&self, from: ConnectionId, message: &RoomMessage) -> Vec<Outgoing> {
        self.members
            .iter()
            .filter(|member| **member != from)
            .map(|member| Outgoing::new(*member, message.clone()))
            .collect()
    }

    /// Keep the newer entries and return the ones that were accepted.
    fn merge_awareness(&mut self, from: ConnectionId, update: &AwarenessUpdate) -> AwarenessUpdate {
        let mut accepted = Vec::new();
        for entry in &update.entries {
            if entry.clock > MAX_CLOCK {
                warn!("Dropping awareness entry of client {} at clock {}", entry.client, entry.clock);
                continue;
            }
            let newer = match self.awareness.get(&entry.client) {
                None => true,
                Some(current) => {
                    entry.clock > current.clock
                        || (entry.clock == current.clock
                            && entry.state.is_none()
                            && current.state.is_some())
                }
            };
            if !newer {
                continue;
            }

            let owned = self.owners.entry(from).or_default();
            if entry.state.is_some() {
                owned.insert(entry.client);
            } else {
                owned.remove(&entry.client);
            }
            self.awareness.insert(entry.client, entry.clone());
            accepted.push(entry.clone());
        }
        AwarenessUpdate { entries: accepted }
    }

    /// Tombstone every client `connection` introduced.
    fn drop_awareness_of(&mut self, connection: ConnectionId) -> AwarenessUpdate {
        let clients = self.owners.remove(&connection).unwrap_or_default();
        let mut entries = Vec::new();
        for client in clients {
            if let Some(current) = self.awareness.get_mut(&client) {
                if current.state.is_none() {
                    continue;
                }
                // Same clock: the owner renews with a higher one when it returns.
                current.state = None;
                entries.push(current.clone());
            }
        }
        AwarenessUpdate { entries }
    }
}

/// Every room served by one relay.
#[derive(Default)]
pub struct RoomHub {
    rooms: HashMap<String, Room>,
    membership: HashMap<ConnectionId, String>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_of(&self, connection: ConnectionId) -> Option<&str> {
        self.membership.get(&connection).map(String::as_str)
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|room| room.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Full snapshot of a room's document.
    pub fn snapshot(&self, room: &str) -> Result<Option<Vec<u8>>> {
        let Some(room) = self.rooms.get(room) else {
            return Ok(None);
        };
        room.doc
            .export(ExportMode::Snapshot)
            .map(Some)
            .map_err(|e| RoomError::Loro(e.to_string()))
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// The new member is sent the room's version vector and its live presence.
    pub fn join(&mut self, room_name: &str, connection: ConnectionId) -> Result<Vec<Outgoing>> {
        let room_name = validate_room(room_name)?.to_string();
        if self.membership.contains_key(&connection) {
            return Err(RoomError::AlreadyJoined(connection));
        }

        let room = self.rooms.entry(room_name.clone()).or_insert_with(|| {
            info!("Opening room {}", room_name);
            Room::new()
        });
        room.members.insert(connection);
        self.membership.insert(connection, room_name.clone());
        debug!(
            "Connection {} joined {} ({} members)",
            connection,
            room_name,
            room.members.len()
        );

        let mut out = vec![Outgoing::new(
            connection,
            RoomMessage::SyncStep1 {
                version: room.doc.state_vv().encode(),
            },
        )];
        let awareness = room.live_awareness();
        if !awareness.is_empty() {
            out.push(Outgoing::new(
                connection,
                RoomMessage::Awareness { update: awareness },
            ));
        }
        Ok(out)
    }

    /// Handle one message from a member.
    pub fn receive(&mut self, connection: ConnectionId, message: RoomMessage) -> Result<Vec<Outgoing>> {
        let room_name = self
            .membership
            .get(&connection)
            .ok_or(RoomError::UnknownConnection(connection))?;
        let room = self
            .rooms
            .get_mut(room_name)
            .ok_or(RoomError::UnknownConnection(connection))?;

        match message {
            RoomMessage::SyncStep1 { version } => {
                let from = VersionVector::decode(&version)
                    .map_err(|e| RoomError::Loro(e.to_string()))?;
                let update = room
                    .doc
                    .export(ExportMode::updates(&from))
                    .map_err(|e| RoomError::Loro(e.to_string()))?;
                Ok(vec![Outgoing::new(connection, RoomMessage::SyncStep2 { update })])
            }

            RoomMessage::SyncStep2 { update } | RoomMessage::Update { update } => {
                let before = room.doc.state_vv();
                room.doc
                    .import(&update)
                    .map_err(|e| RoomError::Loro(e.to_string()))?;
                if room.doc.state_vv() == before {
                    return Ok(Vec::new());
                }
                Ok(room.broadcast(connection, &RoomMessage::Update { update }))
            }

            RoomMessage::Awareness { update } => {
                let accepted = room.merge_awareness(connection, &update);
                if accepted.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(room.broadcast(connection, &RoomMessage::Awareness { update: accepted }))
            }

            RoomMessage::QueryAwareness => Ok(vec![Outgoing::new(
                connection,
                RoomMessage::Awareness {
                    update: room.live_awareness(),
                },
            )]),
        }
    }

    /// Remove a connection. Its presence is tombstoned for the remaining
    /// members; a room left empty is dropped.
    pub fn leave(&mut self, connection: ConnectionId) -> Vec<Outgoing> {
        let Some(room_name) = self.membership.remove(&connection) else {
            return Vec::new();
        };
        let Some(room) = self.rooms.get_mut(&room_name) else {
            warn!("Connection {} was in missing room {}", connection, room_name);
            return Vec::new();
        };

        room.members.remove(&connection);
        let tombstones = room.drop_awareness_of(connection);
        debug!(
            "Connection {} left {} ({} members)",
            connection,
            room_name,
            room.members.len()
        );

        if room.members.is_empty() {
            info!("Closing empty room {}", room_name);
            self.rooms.remove(&room_name);
            return Vec::new();
        }

        if tombstones.is_empty() {
            return Vec::new();
        }
        room.broadcast(connection, &RoomMessage::Awareness { update: tombstones })
    }
}
