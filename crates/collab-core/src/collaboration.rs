//! Collaboration: one editor's session in a room.
//!
//! Composes the diagram, the shared document, the bridge between them, the
//! provider talking to the relay, presence and the operator lock. All work
//! happens inside calls on this handle; `poll` is the cooperative step that
//! moves data in both directions.

use crate::bridge::GraphBridge;
use crate::cell::{Cell, EdgeInit, NodeInit, Operator, Point};
use crate::codec::CellCodec;
use crate::config::CollabConfig;
use crate::diagram::Diagram;
use crate::document::{DocumentError, SharedDocument};
use crate::events::{Origin, Subscription};
use crate::lifecycle::{SyncLifecycle, Transition};
use crate::lock::OperatorLock;
use crate::presence::{Awareness, PresenceManager, PresenceState};
use crate::provider::{Provider, ProviderEvent};
use crate::replica_id::ReplicaId;
use crate::storage::{open_scope, Identity, IdentityProvider, StoredIdentity};
use crate::transport::Transport;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("No diagram was provided")]
    MissingDiagram,

    #[error("No transport was provided")]
    MissingTransport,

    #[error("Invalid room name: {0:?}")]
    InvalidRoom(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, CollabError>;

pub struct CollaborationBuilder<D: Diagram, T: Transport> {
    config: CollabConfig,
    diagram: Option<D>,
    transport: Option<T>,
    identity: Option<Box<dyn IdentityProvider>>,
    display_name: Option<String>,
    display_color: Option<String>,
    replica: Option<ReplicaId>,
}

impl<D: Diagram, T: Transport> CollaborationBuilder<D, T> {
    pub fn new(config: CollabConfig) -> Self {
        Self {
            config,
            diagram: None,
            transport: None,
            identity: None,
            display_name: None,
            display_color: None,
            replica: None,
        }
    }

    pub fn diagram(mut self, diagram: D) -> Self {
        self.diagram = Some(diagram);
        self
    }

    pub fn transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where the display identity comes from. Defaults to the identity stored
    /// in the configured scope.
    pub fn identity(mut self, provider: impl IdentityProvider + 'static) -> Self {
        self.identity = Some(Box::new(provider));
        self
    }

    /// Override the provided display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Override the provided display color.
    pub fn display_color(mut self, color: impl Into<String>) -> Self {
        self.display_color = Some(color.into());
        self
    }

    /// Use a fixed replica id instead of a random one.
    pub fn replica_id(mut self, replica: ReplicaId) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn build(self) -> Result<Collaboration<D, T>> {
        let mut diagram = self.diagram.ok_or(CollabError::MissingDiagram)?;
        let transport = self.transport.ok_or(CollabError::MissingTransport)?;
        let url = self
            .config
            .url()
            .map_err(|_| CollabError::InvalidRoom(self.config.room.clone()))?;

        let mut identity = match self.identity {
            Some(mut provider) => provider.identity(),
            None => {
                let store = open_scope(self.config.identity_scope, &self.config.identity_path);
                StoredIdentity::new(store).identity()
            }
        };
        if let Some(name) = self.display_name {
            identity.name = name;
        }
        if let Some(color) = self.display_color {
            identity.color = color;
        }

        let replica = self.replica.unwrap_or_else(ReplicaId::generate);
        let doc = SharedDocument::with_replica(replica)?;

        let bridge = GraphBridge::attach(&doc, CellCodec::new(self.config.presentation.clone()));
        bridge.sync_initial_state(&diagram, &doc);
        bridge.process_local(&mut diagram, &doc);

        let awareness = Rc::new(RefCell::new(Awareness::with_random_id()));
        let presence = PresenceManager::new(Rc::clone(&awareness), replica, self.config.presence);
        let provider = Provider::new(transport, awareness);
        let lock = OperatorLock::new(Operator {
            id: replica,
            name: identity.name.clone(),
            color: identity.color.clone(),
        });

        info!("Joining {} as {} ({})", url, identity.name, replica);

        Ok(Collaboration {
            config: self.config,
            diagram,
            doc,
            bridge,
            provider,
            presence,
            lock,
            lifecycle: SyncLifecycle::new(),
            identity,
            subscriptions: Vec::new(),
            destroyed: false,
        })
    }
}

pub struct Collaboration<D: Diagram, T: Transport> {
    config: CollabConfig,
    diagram: D,
    doc: SharedDocument,
    bridge: GraphBridge,
    provider: Provider<T>,
    presence: PresenceManager,
    lock: OperatorLock,
    lifecycle: SyncLifecycle<Collaboration<D, T>>,
    identity: Identity,
    subscriptions: Vec<Subscription>,
    destroyed: bool,
}

impl<D: Diagram, T: Transport> Collaboration<D, T> {
    pub fn builder(config: CollabConfig) -> CollaborationBuilder<D, T> {
        CollaborationBuilder::new(config)
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.doc.replica_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn current_user_color(&self) -> &str {
        &self.identity.color
    }

    pub fn diagram(&self) -> &D {
        &self.diagram
    }

    /// Direct diagram access. Mutations made here with `Origin::Local` are
    /// published on the next `poll`.
    pub fn diagram_mut(&mut self) -> &mut D {
        &mut self.diagram
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.provider.transport_mut()
    }

    pub fn is_synced(&self) -> bool {
        self.lifecycle.is_synced()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Run `callback` once the room is synced: now if it already is,
    /// otherwise at the next transition into synced.
    pub fn on_ready(&mut self, callback: impl FnOnce(&mut Self) + 'static) {
        if self.destroyed {
            return;
        }
        if let Some(callback) = self.lifecycle.on_ready(Box::new(callback)) {
            callback(self);
        }
    }

    /// Listen for peer list changes caused by other replicas.
    pub fn on_awareness_change(&mut self, callback: impl Fn(&[PresenceState]) + 'static) {
        if self.destroyed {
            return;
        }
        self.subscriptions.push(self.presence.on_change(callback));
    }

    pub fn peers(&self) -> Vec<PresenceState> {
        self.presence.list_peers()
    }

    /// Add a node and write it to the shared maps.
    pub fn add_node(&mut self, init: NodeInit) -> Cell {
        let cell = self.diagram.add_node(init, Origin::Local);
        self.publish_local();
        cell
    }

    pub fn add_edge(&mut self, init: EdgeInit) -> Cell {
        let cell = self.diagram.add_edge(init, Origin::Local);
        self.publish_local();
        cell
    }

    pub fn remove_cell(&mut self, id: &str) -> Option<Cell> {
        let removed = self.diagram.remove_cell(id, Origin::Local);
        self.publish_local();
        removed
    }

    /// Move a node. Invalid coordinates or a missing node leave the diagram unchanged.
    pub fn move_node(&mut self, id: &str, x: f64, y: f64) -> bool {
        let moved = self.bridge.update_node_position(&mut self.diagram, id, x, y);
        self.publish_local();
        moved
    }

    /// Resize a node. Invalid sizes or a missing node leave the diagram unchanged.
    pub fn resize_node(&mut self, id: &str, width: f64, height: f64) -> bool {
        let resized = self.bridge.update_node_size(&mut self.diagram, id, width, height);
        self.publish_local();
        resized
    }

    /// Publish the pointer. Takes device coordinates and translates them
    /// into the diagram's local space.
    pub fn update_mouse_position(&mut self, client_x: f64, client_y: f64) {
        let local = self.diagram.client_to_local(Point::new(client_x, client_y));
        self.presence.update_pointer(local.x, local.y);
    }

    pub fn try_acquire(&mut self, id: &str) -> bool {
        let granted = self.lock.try_acquire(&mut self.diagram, id);
        self.publish_local();
        granted
    }

    pub fn release(&mut self, id: &str) {
        self.lock.release(&mut self.diagram, id);
        self.publish_local();
    }

    pub fn can_operate(&self, id: &str) -> bool {
        self.lock.can_operate(&self.diagram, id)
    }

    fn publish_local(&mut self) {
        self.bridge.process_local(&mut self.diagram, &self.doc);
    }

    /// One cooperative step: transport events, remote changes, sync
    /// transitions, local diagram events, outbound flush, presence listeners.
    pub fn poll(&mut self) {
        if self.destroyed {
            return;
        }

        let events = self.provider.poll(&self.doc);
        self.bridge.process_remote(&mut self.diagram);

        for event in events {
            let ProviderEvent::Synced(synced) = event;
            match self.lifecycle.transition(synced) {
                Transition::Synced => self.enter_synced(),
                Transition::Unsynced => debug!("Room {} unsynced", self.config.room),
                Transition::Unchanged => {}
            }
            if self.destroyed {
                return;
            }
        }

        self.publish_local();
        self.provider.flush(&self.doc);
        self.presence.notify();
    }

    fn enter_synced(&mut self) {
        info!("Room {} synced", self.config.room);
        self.presence
            .publish_self(&self.identity.name, &self.identity.color);
        self.publish_local();
        self.provider.flush(&self.doc);

        for callback in self.lifecycle.take_ready() {
            callback(self);
            if self.destroyed {
                return;
            }
        }
    }

    /// Leave the room: tombstone presence, close the transport and drop
    /// every subscription. Later calls do nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.presence.clear();
        self.provider.flush(&self.doc);
        self.provider.close();
        self.bridge.detach();
        self.subscriptions.clear();
        self.lifecycle.clear();
        info!("Left room {}", self.config.room);
    }
}

impl<D: Diagram, T: Transport> Drop for Collaboration<D, T> {
    fn drop(&mut self) {
        self.destroy();
    }
}
