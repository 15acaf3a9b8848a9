//! Provider: keeps one replica's document and awareness in sync with its
//! relay over a `Transport`.
//!
//! The provider is sans-IO: `poll` drains transport events and reacts to
//! them, `flush` ships what changed locally since the last flush. Local
//! edits made while disconnected are not queued here; the handshake on the
//! next connection carries them.

use crate::document::SharedDocument;
use crate::events::Origin;
use crate::presence::Awareness;
use crate::protocol::RoomMessage;
use crate::transport::{Transport, TransportEvent};
use loro::VersionVector;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Something the owner has to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The sync flag changed.
    Synced(bool),
}

pub struct Provider<T: Transport> {
    transport: T,
    awareness: Rc<RefCell<Awareness>>,
    connected: bool,
    synced: bool,
    closed: bool,
    /// Version already shipped to the relay.
    shipped: Option<VersionVector>,
}

impl<T: Transport> Provider<T> {
    pub fn new(transport: T, awareness: Rc<RefCell<Awareness>>) -> Self {
        Self {
            transport,
            awareness,
            connected: false,
            synced: false,
            closed: false,
            shipped: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Handle every pending transport event.
    pub fn poll(&mut self, doc: &SharedDocument) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }

        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Connected => self.on_connected(doc),
                TransportEvent::Message(message) => self.on_message(doc, message, &mut events),
                TransportEvent::Disconnected => self.on_disconnected(&mut events),
            }
        }
        events
    }

    fn on_connected(&mut self, doc: &SharedDocument) {
        info!("Connected to relay");
        self.connected = true;
        self.shipped = Some(doc.version());
        self.transport.send(RoomMessage::SyncStep1 {
            version: doc.encoded_version(),
        });

        let mut awareness = self.awareness.borrow_mut();
        awareness.renew_local();
        awareness.take_local_dirty();
        if awareness.local_state().is_some() {
            self.transport.send(RoomMessage::Awareness {
                update: awareness.encode_local(),
            });
        }
    }

    fn on_disconnected(&mut self, events: &mut Vec<ProviderEvent>) {
        info!("Disconnected from relay");
        self.connected = false;
        self.shipped = None;

        let mut awareness = self.awareness.borrow_mut();
        let peers = awareness.remote_clients();
        awareness.remove_states(&peers, Origin::Remote);

        if self.synced {
            self.synced = false;
            events.push(ProviderEvent::Synced(false));
        }
    }

    fn on_message(&mut self, doc: &SharedDocument, message: RoomMessage, events: &mut Vec<ProviderEvent>) {
        debug!("Received {}", message.name());
        match message {
            RoomMessage::SyncStep1 { version } => match doc.export_updates_since(&version) {
                Ok(update) => self.transport.send(RoomMessage::SyncStep2 { update }),
                Err(e) => warn!("Failed to answer sync step 1: {}", e),
            },

            RoomMessage::SyncStep2 { update } => {
                self.import(doc, &update);
                if !self.synced {
                    self.synced = true;
                    events.push(ProviderEvent::Synced(true));
                }
            }

            RoomMessage::Update { update } => self.import(doc, &update),

            RoomMessage::Awareness { update } => {
                self.awareness.borrow_mut().apply_update(&update, Origin::Remote);
            }

            RoomMessage::QueryAwareness => {
                let update = self.awareness.borrow().encode_all();
                self.transport.send(RoomMessage::Awareness { update });
            }
        }
    }

    /// Import a peer update without echoing it back on the next flush.
    fn import(&mut self, doc: &SharedDocument, update: &[u8]) {
        self.flush_document(doc);
        if let Err(e) = doc.import(update) {
            warn!("Failed to import update: {}", e);
        }
        if self.connected {
            self.shipped = Some(doc.version());
        }
    }

    /// Ship local document changes and the local awareness entry, if changed.
    pub fn flush(&mut self, doc: &SharedDocument) {
        if !self.connected || self.closed {
            return;
        }
        self.flush_document(doc);

        let mut awareness = self.awareness.borrow_mut();
        if awareness.take_local_dirty() {
            self.transport.send(RoomMessage::Awareness {
                update: awareness.encode_local(),
            });
        }
    }

    fn flush_document(&mut self, doc: &SharedDocument) {
        let Some(shipped) = &self.shipped else {
            return;
        };
        let current = doc.version();
        if *shipped == current {
            return;
        }

        match doc.export_updates(shipped) {
            Ok(update) => {
                debug!("Shipping {} byte update", update.len());
                self.transport.send(RoomMessage::Update { update });
                self.shipped = Some(current);
            }
            Err(e) => warn!("Failed to export update: {}", e),
        }
    }

    /// Close the transport. The provider ignores its transport afterwards.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.transport.close();
        self.closed = true;
        self.connected = false;
        self.synced = false;
        self.shipped = None;
    }
}
