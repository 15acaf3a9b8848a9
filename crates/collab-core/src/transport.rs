//! Transport abstraction and an in-process loopback implementation.
//!
//! A transport moves `RoomMessage`s between one replica and its relay and
//! reports connection state as events. It is polled: the owner drains
//! `poll_event` during its cooperative step, so nothing is delivered
//! re-entrantly.

use crate::protocol::RoomMessage;
use crate::room::{ConnectionId, Outgoing, RoomError, RoomHub};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message(RoomMessage),
    Disconnected,
}

pub trait Transport {
    /// Queue a message for the relay. Dropped while disconnected.
    fn send(&mut self, message: RoomMessage);

    /// Next pending event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Close the connection for good.
    fn close(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, message: RoomMessage) {
        (**self).send(message)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        (**self).poll_event()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Default)]
struct HubInner {
    hub: RoomHub,
    queues: HashMap<ConnectionId, VecDeque<TransportEvent>>,
    next_id: ConnectionId,
}

impl HubInner {
    fn deliver(&mut self, outgoing: Vec<Outgoing>) {
        for Outgoing { to, message } in outgoing {
            if let Some(queue) = self.queues.get_mut(&to) {
                queue.push_back(TransportEvent::Message(message));
            }
        }
    }

    fn push(&mut self, connection: ConnectionId, event: TransportEvent) {
        self.queues.entry(connection).or_default().push_back(event);
    }
}

/// An in-process relay that loopback transports connect to.
///
/// Cloning yields another handle to the same relay.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Rc<RefCell<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection to `room`.
    pub fn connect(&self, room: &str) -> Result<LoopbackTransport, RoomError> {
        let connection = {
            let mut inner = self.inner.borrow_mut();
            inner.next_id += 1;
            inner.next_id
        };

        let mut transport = LoopbackTransport {
            inner: Rc::clone(&self.inner),
            room: room.to_string(),
            connection,
            connected: false,
            closed: false,
        };
        transport.open()?;
        Ok(transport)
    }

    pub fn room_count(&self) -> usize {
        self.inner.borrow().hub.room_count()
    }

    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.inner.borrow().hub.members(room)
    }
}

pub struct LoopbackTransport {
    inner: Rc<RefCell<HubInner>>,
    room: String,
    connection: ConnectionId,
    connected: bool,
    closed: bool,
}

impl LoopbackTransport {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn open(&mut self) -> Result<(), RoomError> {
        let mut inner = self.inner.borrow_mut();
        let outgoing = inner.hub.join(&self.room, self.connection)?;
        inner.push(self.connection, TransportEvent::Connected);
        inner.deliver(outgoing);
        self.connected = true;
        Ok(())
    }

    /// Drop the connection as a network failure would.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        let outgoing = inner.hub.leave(self.connection);
        inner.deliver(outgoing);
        if let Some(queue) = inner.queues.get_mut(&self.connection) {
            queue.retain(|event| !matches!(event, TransportEvent::Message(_)));
        }
        inner.push(self.connection, TransportEvent::Disconnected);
        self.connected = false;
        debug!("Loopback connection {} dropped", self.connection);
    }

    /// Re-establish a dropped connection.
    pub fn reconnect(&mut self) -> Result<(), RoomError> {
        if self.connected || self.closed {
            return Ok(());
        }
        self.open()
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, message: RoomMessage) {
        if !self.connected {
            debug!("Dropping {} on closed loopback connection", message.name());
            return;
        }
        let mut inner = self.inner.borrow_mut();
        match inner.hub.receive(self.connection, message) {
            Ok(outgoing) => inner.deliver(outgoing),
            Err(e) => debug!("Loopback relay rejected message: {}", e),
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.inner
            .borrow_mut()
            .queues
            .get_mut(&self.connection)?
            .pop_front()
    }

    fn close(&mut self) {
        self.disconnect();
        self.closed = true;
        self.inner.borrow_mut().queues.remove(&self.connection);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.close();
        }
    }
}
