//! Presence: ephemeral per-connection state shared with the room.
//!
//! `Awareness` is the raw channel: a table of client id -> `{clock, state}`
//! where a newer clock wins and a `None` state is a tombstone. States are
//! JSON values so relays can forward them without knowing their shape.
//!
//! `PresenceManager` layers the editor's identity, color and pointer on
//! top of it and exposes the peer list.
//!
//! Pointer coordinates are in the diagram's local space. Callers translate
//! device coordinates (see `Diagram::client_to_local`) before calling
//! `update_pointer`.

use crate::cell::Point;
use crate::events::{EventBus, Origin, Subscription};
use crate::replica_id::ReplicaId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Numeric id of one awareness participant (one connection).
pub type ClientId = u64;

/// Highest clock an entry may carry. An entry at `u32::MAX` could never be
/// superseded, so it is rejected on receipt and local clocks stop below it.
pub const MAX_CLOCK: u32 = u32::MAX - 1;

fn next_clock(clock: u32) -> u32 {
    clock.saturating_add(1).min(MAX_CLOCK)
}

/// One client's entry in an awareness update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client: ClientId,
    pub clock: u32,
    /// JSON-encoded state, `None` for a tombstone.
    pub state: Option<String>,
}

/// A batch of awareness entries as sent over the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.entries.iter().map(|entry| entry.client)
    }
}

/// Which clients an applied update or local write affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: Origin,
}

impl AwarenessChange {
    fn new(origin: Origin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// The awareness table of one replica.
///
/// Changes are queued and drained with `take_changes`, so readers never
/// observe the table while it is being written.
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    clocks: BTreeMap<ClientId, u32>,
    states: BTreeMap<ClientId, Value>,
    changes: Vec<AwarenessChange>,
    local_dirty: bool,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            clocks: BTreeMap::new(),
            states: BTreeMap::new(),
            changes: Vec::new(),
            local_dirty: false,
        }
    }

    /// Awareness with a random client id.
    pub fn with_random_id() -> Self {
        use rand::Rng;
        Self::new(rand::rng().random_range(1..=u32::MAX as u64))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.client_id)
    }

    /// Live (non-tombstoned) states, including this client's own.
    pub fn states(&self) -> &BTreeMap<ClientId, Value> {
        &self.states
    }

    pub fn clock(&self, client: ClientId) -> Option<u32> {
        self.clocks.get(&client).copied()
    }

    /// Replace the local state. `None` publishes a tombstone.
    pub fn set_local_state(&mut self, state: Option<Value>) {
        let client = self.client_id;
        let clock = self.clocks.get(&client).map_or(0, |c| next_clock(*c));
        self.clocks.insert(client, clock);
        self.local_dirty = true;

        let mut change = AwarenessChange::new(Origin::Local);
        match state {
            Some(state) => match self.states.insert(client, state.clone()) {
                None => change.added.push(client),
                Some(previous) if previous != state => change.updated.push(client),
                Some(_) => {}
            },
            None => {
                if self.states.remove(&client).is_some() {
                    change.removed.push(client);
                }
            }
        }
        self.push_change(change);
    }

    /// Republish the local state under a new clock.
    ///
    /// Peers that saw this client's entry tombstoned at its current clock
    /// accept the state again.
    pub fn renew_local(&mut self) {
        if self.local_state().is_none() {
            return;
        }
        let client = self.client_id;
        let clock = self.clocks.get(&client).map_or(0, |c| next_clock(*c));
        self.clocks.insert(client, clock);
        self.local_dirty = true;
    }

    /// Apply a peer's update. Entries with an older clock are ignored.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, origin: Origin) -> AwarenessChange {
        let mut change = AwarenessChange::new(origin);

        for entry in &update.entries {
            if entry.clock > MAX_CLOCK {
                warn!("Skipping awareness entry of client {} at clock {}", entry.client, entry.clock);
                continue;
            }

            if entry.client == self.client_id {
                // Somebody tombstoned us (e.g. a relay after a reconnect): re-announce.
                if entry.state.is_none() && self.local_state().is_some() {
                    let clock = self.clocks.get(&self.client_id).copied().unwrap_or(0);
                    self.clocks.insert(self.client_id, next_clock(clock.max(entry.clock)));
                    self.local_dirty = true;
                }
                continue;
            }

            let current = self.clocks.get(&entry.client).copied();
            let is_newer = match current {
                None => true,
                Some(clock) => {
                    entry.clock > clock
                        || (entry.clock == clock
                            && entry.state.is_none()
                            && self.states.contains_key(&entry.client))
                }
            };
            if !is_newer {
                continue;
            }

            let state = match entry.state.as_deref().map(serde_json::from_str::<Value>) {
                None => None,
                Some(Ok(Value::Null)) => None,
                Some(Ok(state)) => Some(state),
                Some(Err(e)) => {
                    warn!("Skipping malformed awareness state of client {}: {}", entry.client, e);
                    continue;
                }
            };

            self.clocks.insert(entry.client, entry.clock);
            match state {
                Some(state) => match self.states.insert(entry.client, state.clone()) {
                    None => change.added.push(entry.client),
                    Some(previous) if previous != state => change.updated.push(entry.client),
                    Some(_) => {}
                },
                None => {
                    if self.states.remove(&entry.client).is_some() {
                        change.removed.push(entry.client);
                    }
                }
            }
        }

        self.push_change(change.clone());
        change
    }

    /// Forget the given peers' states and clocks (the connection that carried
    /// them is gone). Whatever the relay sends next is accepted.
    pub fn remove_states(&mut self, clients: &[ClientId], origin: Origin) -> AwarenessChange {
        let mut change = AwarenessChange::new(origin);
        for client in clients {
            if *client == self.client_id {
                continue;
            }
            self.clocks.remove(client);
            if self.states.remove(client).is_some() {
                change.removed.push(*client);
            }
        }
        self.push_change(change.clone());
        change
    }

    /// Ids of every peer with a live state.
    pub fn remote_clients(&self) -> Vec<ClientId> {
        self.states
            .keys()
            .copied()
            .filter(|client| *client != self.client_id)
            .collect()
    }

    /// Encode the current entries of `clients` (tombstones included).
    pub fn encode_update(&self, clients: &[ClientId]) -> AwarenessUpdate {
        let entries = clients
            .iter()
            .filter_map(|client| {
                let clock = *self.clocks.get(client)?;
                let state = self.states.get(client).map(Value::to_string);
                Some(AwarenessEntry {
                    client: *client,
                    clock,
                    state,
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    pub fn encode_local(&self) -> AwarenessUpdate {
        self.encode_update(&[self.client_id])
    }

    /// Every live state this replica knows about.
    pub fn encode_all(&self) -> AwarenessUpdate {
        let clients: Vec<_> = self.states.keys().copied().collect();
        self.encode_update(&clients)
    }

    /// Whether the local entry changed since the last call.
    pub fn take_local_dirty(&mut self) -> bool {
        std::mem::take(&mut self.local_dirty)
    }

    pub fn take_changes(&mut self) -> Vec<AwarenessChange> {
        std::mem::take(&mut self.changes)
    }

    fn push_change(&mut self, change: AwarenessChange) {
        if !change.is_empty() {
            self.changes.push(change);
        }
    }
}

/// An editor's published presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Replica id of the editor.
    pub id: ReplicaId,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse: Option<Point>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresencePolicy {
    /// List peers that have not reported a pointer position yet.
    pub include_cursorless: bool,
}

type PeerList = Vec<PresenceState>;

pub struct PresenceManager {
    awareness: Rc<RefCell<Awareness>>,
    replica: ReplicaId,
    policy: PresencePolicy,
    listeners: Rc<EventBus<PeerList>>,
}

impl PresenceManager {
    pub fn new(awareness: Rc<RefCell<Awareness>>, replica: ReplicaId, policy: PresencePolicy) -> Self {
        Self {
            awareness,
            replica,
            policy,
            listeners: Rc::new(EventBus::new()),
        }
    }

    pub fn awareness(&self) -> &Rc<RefCell<Awareness>> {
        &self.awareness
    }

    /// Publish this replica's identity, without a pointer.
    pub fn publish_self(&self, name: &str, color: &str) {
        let state = PresenceState {
            id: self.replica,
            name: name.to_string(),
            color: color.to_string(),
            mouse: None,
        };
        match serde_json::to_value(&state) {
            Ok(value) => {
                debug!("Publishing presence as {} ({})", state.name, state.id);
                self.awareness.borrow_mut().set_local_state(Some(value));
            }
            Err(e) => warn!("Failed to encode presence: {}", e),
        }
    }

    /// Merge a pointer position (diagram-local coordinates) into the local state.
    ///
    /// Returns false if the point is not finite or presence was not published yet.
    pub fn update_pointer(&self, x: f64, y: f64) -> bool {
        let point = Point::new(x, y);
        if !point.is_finite() {
            warn!("Ignoring non-finite pointer position ({}, {})", x, y);
            return false;
        }

        let Some(mut state) = self.local_state() else {
            debug!("Pointer moved before presence was published");
            return false;
        };
        state.mouse = Some(point);

        match serde_json::to_value(&state) {
            Ok(value) => {
                self.awareness.borrow_mut().set_local_state(Some(value));
                true
            }
            Err(e) => {
                warn!("Failed to encode presence: {}", e);
                false
            }
        }
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        let awareness = self.awareness.borrow();
        let value = awareness.local_state()?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Every peer's presence, never including this replica.
    pub fn list_peers(&self) -> Vec<PresenceState> {
        let awareness = self.awareness.borrow();

        awareness
            .states()
            .iter()
            .filter(|(client, _)| **client != awareness.client_id())
            .filter_map(|(client, value)| {
                match serde_json::from_value::<PresenceState>(value.clone()) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        debug!("Ignoring non-presence state of client {}: {}", client, e);
                        None
                    }
                }
            })
            .filter(|state| state.id != self.replica)
            .filter(|state| self.policy.include_cursorless || state.mouse.is_some())
            .collect()
    }

    /// Listen for peer list changes caused by remote awareness updates.
    pub fn on_change(&self, callback: impl Fn(&[PresenceState]) + 'static) -> Subscription {
        self.listeners.subscribe(move |peers: &PeerList| callback(peers))
    }

    /// Drain queued awareness changes and notify listeners once if any of
    /// them came from a peer. Returns whether listeners were notified.
    pub fn notify(&self) -> bool {
        let changes = self.awareness.borrow_mut().take_changes();
        if !changes.iter().any(|change| change.origin.is_remote()) {
            return false;
        }
        let peers = self.list_peers();
        self.listeners.emit(&peers);
        true
    }

    /// Tombstone the local state.
    pub fn clear(&self) {
        self.awareness.borrow_mut().set_local_state(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn presence(client: ClientId, replica: u64) -> PresenceManager {
        PresenceManager::new(
            Rc::new(RefCell::new(Awareness::new(client))),
            ReplicaId::from(replica),
            PresencePolicy::default(),
        )
    }

    fn peer_entry(client: ClientId, clock: u32, state: Value) -> AwarenessEntry {
        AwarenessEntry {
            client,
            clock,
            state: Some(state.to_string()),
        }
    }

    #[test]
    fn test_newer_clock_wins() {
        let mut awareness = Awareness::new(1);
        let update = |clock, name: &str| AwarenessUpdate {
            entries: vec![peer_entry(2, clock, json!({"name": name}))],
        };

        let change = awareness.apply_update(&update(1, "first"), Origin::Remote);
        assert_eq!(change.added, vec![2]);

        let change = awareness.apply_update(&update(0, "stale"), Origin::Remote);
        assert!(change.is_empty());
        assert_eq!(awareness.states()[&2]["name"], "first");

        let change = awareness.apply_update(&update(2, "second"), Origin::Remote);
        assert_eq!(change.updated, vec![2]);
    }

    #[test]
    fn test_tombstone_removes_state() {
        let mut awareness = Awareness::new(1);
        awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![peer_entry(2, 3, json!({}))],
            },
            Origin::Remote,
        );

        let change = awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![AwarenessEntry {
                    client: 2,
                    clock: 3,
                    state: None,
                }],
            },
            Origin::Remote,
        );
        assert_eq!(change.removed, vec![2]);
        assert!(awareness.states().is_empty());
    }

    #[test]
    fn test_malformed_state_skipped() {
        let mut awareness = Awareness::new(1);
        let change = awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![
                    AwarenessEntry {
                        client: 2,
                        clock: 0,
                        state: Some("{not json".into()),
                    },
                    peer_entry(3, 0, json!({"ok": true})),
                ],
            },
            Origin::Remote,
        );
        assert_eq!(change.added, vec![3]);
    }

    #[test]
    fn test_tombstone_of_self_reannounces() {
        let mut awareness = Awareness::new(1);
        awareness.set_local_state(Some(json!({"name": "me"})));
        awareness.take_local_dirty();

        awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![AwarenessEntry {
                    client: 1,
                    clock: 5,
                    state: None,
                }],
            },
            Origin::Remote,
        );

        assert!(awareness.local_state().is_some());
        assert!(awareness.take_local_dirty());
        assert_eq!(awareness.clock(1), Some(6));
    }

    #[test]
    fn test_max_clock_tombstone_of_self_is_ignored() {
        let mut awareness = Awareness::new(1);
        awareness.set_local_state(Some(json!({"name": "me"})));
        awareness.take_local_dirty();

        let change = awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![AwarenessEntry {
                    client: 1,
                    clock: u32::MAX,
                    state: None,
                }],
            },
            Origin::Remote,
        );

        assert!(change.is_empty());
        assert_eq!(awareness.clock(1), Some(0));
        assert!(!awareness.take_local_dirty());

        awareness.set_local_state(Some(json!({"name": "me again"})));
        assert_eq!(awareness.clock(1), Some(1));
        assert_eq!(awareness.encode_local().entries[0].clock, 1);
    }

    #[test]
    fn test_max_clock_peer_entry_is_ignored() {
        let mut awareness = Awareness::new(1);
        let change = awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![peer_entry(2, u32::MAX, json!({"name": "stuck"}))],
            },
            Origin::Remote,
        );
        assert!(change.is_empty());
        assert!(awareness.clock(2).is_none());
    }

    #[test]
    fn test_local_clock_saturates() {
        let mut awareness = Awareness::new(1);
        awareness.set_local_state(Some(json!({"name": "me"})));
        awareness.apply_update(
            &AwarenessUpdate {
                entries: vec![AwarenessEntry {
                    client: 1,
                    clock: MAX_CLOCK,
                    state: None,
                }],
            },
            Origin::Remote,
        );
        assert_eq!(awareness.clock(1), Some(MAX_CLOCK));

        awareness.renew_local();
        awareness.set_local_state(Some(json!({"name": "still me"})));
        assert_eq!(awareness.clock(1), Some(MAX_CLOCK));
    }

    #[test]
    fn test_encode_update_carries_tombstones() {
        let mut awareness = Awareness::new(1);
        awareness.set_local_state(Some(json!({"name": "me"})));
        awareness.set_local_state(None);

        let update = awareness.encode_local();
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].clock, 1);
        assert!(update.entries[0].state.is_none());
    }

    #[test]
    fn test_list_peers_excludes_self() {
        for peer_count in 0..4u64 {
            let manager = presence(1, 0xaa);
            manager.publish_self("me", "#000000");
            manager.update_pointer(1.0, 1.0);

            let mut entries = Vec::new();
            for n in 0..peer_count {
                entries.push(peer_entry(
                    10 + n,
                    0,
                    json!({"id": format!("{:016x}", 100 + n), "name": "p", "color": "#111111", "mouse": {"x": 0.0, "y": 0.0}}),
                ));
            }
            // Another connection of this very replica.
            entries.push(peer_entry(
                99,
                0,
                json!({"id": ReplicaId::from(0xaa).to_string(), "name": "me", "color": "#000000", "mouse": {"x": 0.0, "y": 0.0}}),
            ));
            manager
                .awareness()
                .borrow_mut()
                .apply_update(&AwarenessUpdate { entries }, Origin::Remote);

            let peers = manager.list_peers();
            assert_eq!(peers.len() as u64, peer_count);
            assert!(peers.iter().all(|p| p.id != ReplicaId::from(0xaa)));
        }
    }

    #[test]
    fn test_cursorless_policy() {
        let awareness = Rc::new(RefCell::new(Awareness::new(1)));
        awareness.borrow_mut().apply_update(
            &AwarenessUpdate {
                entries: vec![peer_entry(2, 0, json!({"id": "0000000000000002", "name": "p", "color": "#222222"}))],
            },
            Origin::Remote,
        );

        let strict = PresenceManager::new(Rc::clone(&awareness), ReplicaId::from(1), PresencePolicy::default());
        assert!(strict.list_peers().is_empty());

        let lenient = PresenceManager::new(
            awareness,
            ReplicaId::from(1),
            PresencePolicy {
                include_cursorless: true,
            },
        );
        assert_eq!(lenient.list_peers().len(), 1);
    }

    #[test]
    fn test_update_pointer_requires_published_state() {
        let manager = presence(1, 1);
        assert!(!manager.update_pointer(5.0, 5.0));

        manager.publish_self("me", "#abcdef");
        assert!(manager.update_pointer(5.0, 6.0));
        assert!(!manager.update_pointer(f64::INFINITY, 6.0));
        assert_eq!(manager.local_state().unwrap().mouse, Some(Point::new(5.0, 6.0)));
    }

    #[test]
    fn test_notify_only_on_remote_changes() {
        let manager = presence(1, 1);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let calls_clone = Rc::clone(&calls);
        let _sub = manager.on_change(move |peers| calls_clone.borrow_mut().push(peers.len()));

        manager.publish_self("me", "#abcdef");
        assert!(!manager.notify());

        manager.awareness().borrow_mut().apply_update(
            &AwarenessUpdate {
                entries: vec![peer_entry(
                    2,
                    0,
                    json!({"id": "0000000000000002", "name": "p", "color": "#222222", "mouse": {"x": 1.0, "y": 2.0}}),
                )],
            },
            Origin::Remote,
        );
        assert!(manager.notify());
        assert_eq!(*calls.borrow(), vec![1]);
    }

    #[test]
    fn test_clear_tombstones_local_state() {
        let manager = presence(1, 1);
        manager.publish_self("me", "#abcdef");
        manager.clear();
        assert!(manager.local_state().is_none());
        assert!(manager.awareness().borrow().encode_local().entries[0].state.is_none());
    }
}
