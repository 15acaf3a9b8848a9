//! Event infrastructure for collab-core.
//!
//! Provides `Origin` (the structured tag every change notification carries)
//! and `EventBus` for subscriptions. The bridge runs on one logical thread,
//! so the bus is `Rc` + `RefCell` based and callbacks need not be `Send`.

use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::debug;

/// Where a change came from.
///
/// Local changes were made by this replica; remote changes were applied
/// from a peer (imported document updates, awareness updates, or diagram
/// mutations the bridge performed on behalf of a peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn is_local(self) -> bool {
        matches!(self, Origin::Local)
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Origin::Remote)
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Unsubscribe now instead of on drop.
    pub fn cancel(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

type Callback<E> = Rc<dyn Fn(&E)>;

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Rc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RefCell<Vec<(usize, Callback<E>)>>,
    /// Unsubscribes that arrived while `callbacks` was borrowed.
    pending_removals: RefCell<Vec<usize>>,
    next_id: Cell<usize>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
            pending_removals: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(self: &Rc<Self>, callback: impl Fn(&E) + 'static) -> Subscription {
        self.apply_pending_removals();
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.callbacks.borrow_mut().push((id, Rc::new(callback)));

        let bus: Weak<Self> = Rc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(id);
            }
        })
    }

    fn unsubscribe(&self, id: usize) {
        if !self.remove(&[id]) {
            debug!("Event bus busy, deferring unsubscribe of {}", id);
            self.pending_removals.borrow_mut().push(id);
        }
    }

    /// Remove the given callbacks. Returns false if the list is borrowed.
    ///
    /// Removed callbacks are dropped after the borrow ends, since a callback
    /// may own subscriptions to this same bus.
    fn remove(&self, ids: &[usize]) -> bool {
        let removed: Vec<_> = match self.callbacks.try_borrow_mut() {
            Ok(mut callbacks) => {
                let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *callbacks)
                    .into_iter()
                    .partition(|(i, _)| ids.contains(i));
                *callbacks = kept;
                removed
            }
            Err(_) => return false,
        };
        drop(removed);
        true
    }

    fn apply_pending_removals(&self) {
        let ids = std::mem::take(&mut *self.pending_removals.borrow_mut());
        if !ids.is_empty() && !self.remove(&ids) {
            self.pending_removals.borrow_mut().extend(ids);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &E) {
        self.apply_pending_removals();
        // Clone the callback list so a callback may subscribe without a borrow panic.
        let callbacks: Vec<_> = self
            .callbacks
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.apply_pending_removals();
        self.callbacks.borrow().len()
    }
}
