//! SharedDocument: Loro document wrapper holding the replicated diagram.
//!
//! Each room's document has two root maps:
//! - `nodes`: node id -> node snapshot
//! - `edges`: edge id -> edge snapshot
//!
//! Snapshots are stored as plain values, so every map entry is one
//! last-writer-wins register. Writes made through this type emit a
//! `MapChangeSet` tagged `Origin::Local`; imported updates are diffed
//! against the previous map state and emitted tagged `Origin::Remote`.

use crate::cell::CellKind;
use crate::events::{EventBus, Origin, Subscription};
use crate::replica_id::ReplicaId;
use loro::{ExportMode, LoroDoc, LoroMap, ValueOrContainer, VersionVector};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

pub const NODES_MAP: &str = "nodes";
pub const EDGES_MAP: &str = "edges";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

/// One key's change within a map.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
    pub key: String,
    pub action: ChangeAction,
    /// New value for `Add`/`Update`, `None` for `Delete`.
    pub value: Option<Value>,
}

/// All key changes to one map produced by a single write or import.
#[derive(Debug, Clone, PartialEq)]
pub struct MapChangeSet {
    pub kind: CellKind,
    pub origin: Origin,
    pub changes: Vec<KeyChange>,
}

pub fn map_name(kind: CellKind) -> &'static str {
    match kind {
        CellKind::Node => NODES_MAP,
        CellKind::Edge => EDGES_MAP,
    }
}

/// The replicated document shared by every replica in a room.
pub struct SharedDocument {
    doc: LoroDoc,
    bus: Rc<EventBus<MapChangeSet>>,
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDocument {
    /// Create an empty document with a random replica id.
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            bus: Rc::new(EventBus::new()),
        }
    }

    /// Create an empty document writing under a specific replica id.
    pub fn with_replica(replica: ReplicaId) -> Result<Self> {
        let doc = LoroDoc::new();
        doc.set_peer_id(replica.as_u64())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(Self {
            doc,
            bus: Rc::new(EventBus::new()),
        })
    }

    /// This replica's id (the Loro peer id).
    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::from(self.doc.peer_id())
    }

    fn map(&self, kind: CellKind) -> LoroMap {
        self.doc.get_map(map_name(kind))
    }

    /// Observe every change set, local or remote.
    pub fn observe(&self, callback: impl Fn(&MapChangeSet) + 'static) -> Subscription {
        self.bus.subscribe(callback)
    }

    pub fn get(&self, kind: CellKind, key: &str) -> Option<Value> {
        match self.map(kind).get(key)? {
            ValueOrContainer::Value(value) => Some(loro_value_to_json(&value)),
            _ => None,
        }
    }

    pub fn contains(&self, kind: CellKind, key: &str) -> bool {
        self.get(kind, key).is_some()
    }

    /// All entries of a map, ordered by key.
    pub fn entries(&self, kind: CellKind) -> BTreeMap<String, Value> {
        let mut entries = BTreeMap::new();
        if let loro::LoroValue::Map(map) = self.map(kind).get_deep_value() {
            for (key, value) in map.iter() {
                entries.insert(key.clone(), loro_value_to_json(value));
            }
        }
        entries
    }

    pub fn len(&self, kind: CellKind) -> usize {
        self.map(kind).len()
    }

    pub fn is_empty(&self, kind: CellKind) -> bool {
        self.len(kind) == 0
    }

    /// Write a snapshot under `key` and commit.
    pub fn set(&self, kind: CellKind, key: &str, value: Value) -> Result<()> {
        let action = if self.contains(kind, key) {
            ChangeAction::Update
        } else {
            ChangeAction::Add
        };

        self.map(kind)
            .insert(key, value.clone())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.doc.commit();

        self.bus.emit(&MapChangeSet {
            kind,
            origin: Origin::Local,
            changes: vec![KeyChange {
                key: key.to_string(),
                action,
                value: Some(value),
            }],
        });
        Ok(())
    }

    /// Delete `key` and commit. Deleting an absent key is a no-op.
    pub fn delete(&self, kind: CellKind, key: &str) -> Result<()> {
        if !self.contains(kind, key) {
            return Ok(());
        }

        self.map(kind)
            .delete(key)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        self.doc.commit();

        self.bus.emit(&MapChangeSet {
            kind,
            origin: Origin::Local,
            changes: vec![KeyChange {
                key: key.to_string(),
                action: ChangeAction::Delete,
                value: None,
            }],
        });
        Ok(())
    }

    /// Get current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Current version vector, encoded for the wire.
    pub fn encoded_version(&self) -> Vec<u8> {
        self.version().encode()
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export updates since a wire-encoded version vector.
    pub fn export_updates_since(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        let from = VersionVector::decode(encoded)
            .map_err(|e| DocumentError::Serialization(e.to_string()))?;
        self.export_updates(&from)
    }

    /// Import an update or snapshot from a peer.
    ///
    /// Emits one `Remote` change set per map whose entries changed and
    /// returns them. Re-importing known data changes nothing and emits nothing.
    pub fn import(&self, data: &[u8]) -> Result<Vec<MapChangeSet>> {
        let nodes_before = self.entries(CellKind::Node);
        let edges_before = self.entries(CellKind::Edge);

        self.doc
            .import(data)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;

        let mut change_sets = Vec::new();
        for (kind, before) in [(CellKind::Node, nodes_before), (CellKind::Edge, edges_before)] {
            let changes = diff_entries(&before, &self.entries(kind));
            if !changes.is_empty() {
                change_sets.push(MapChangeSet {
                    kind,
                    origin: Origin::Remote,
                    changes,
                });
            }
        }

        debug!(
            "import: {} bytes, {} map(s) changed",
            data.len(),
            change_sets.len()
        );

        for change_set in &change_sets {
            self.bus.emit(change_set);
        }
        Ok(change_sets)
    }
}

/// Key-level difference between two states of a map.
pub fn diff_entries(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> Vec<KeyChange> {
    let mut changes = Vec::new();

    for (key, value) in after {
        match before.get(key) {
            None => changes.push(KeyChange {
                key: key.clone(),
                action: ChangeAction::Add,
                value: Some(value.clone()),
            }),
            Some(old) if old != value => changes.push(KeyChange {
                key: key.clone(),
                action: ChangeAction::Update,
                value: Some(value.clone()),
            }),
            Some(_) => {}
        }
    }

    for key in before.keys() {
        if !after.contains_key(key) {
            changes.push(KeyChange {
                key: key.clone(),
                action: ChangeAction::Delete,
                value: None,
            });
        }
    }

    changes
}

/// Convert LoroValue to serde_json::Value
pub(crate) fn loro_value_to_json(value: &loro::LoroValue) -> Value {
    match value {
        loro::LoroValue::Null => Value::Null,
        loro::LoroValue::Bool(b) => Value::Bool(*b),
        loro::LoroValue::I64(n) => serde_json::json!(*n),
        loro::LoroValue::Double(n) => serde_json::json!(*n),
        loro::LoroValue::String(s) => Value::String(s.to_string()),
        loro::LoroValue::List(list) => Value::Array(list.iter().map(loro_value_to_json).collect()),
        loro::LoroValue::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), loro_value_to_json(v)))
                .collect(),
        ),
        _ => Value::Null, // Binary and container types are never written by the bridge
    }
}
