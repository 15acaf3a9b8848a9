//! Sync lifecycle: the Unsynced/Synced state of a room connection and the
//! callbacks waiting for it to become synced.
//!
//! The state may bounce between the two any number of times. Callbacks are
//! generic over the context they receive so the owner can hand itself to
//! them once they are drained.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Unsynced,
    Synced,
}

/// Result of reporting a sync flag to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Entered `Synced`; the owner publishes presence, then drains callbacks.
    Synced,
    /// Fell back to `Unsynced`.
    Unsynced,
    Unchanged,
}

pub type ReadyCallback<C> = Box<dyn FnOnce(&mut C)>;

pub struct SyncLifecycle<C> {
    state: SyncState,
    ready: Vec<ReadyCallback<C>>,
}

impl<C> Default for SyncLifecycle<C> {
    fn default() -> Self {
        Self {
            state: SyncState::Unsynced,
            ready: Vec::new(),
        }
    }
}

impl<C> SyncLifecycle<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Queue a callback for the next entry into `Synced`.
    ///
    /// When already synced the callback is handed back for the caller to run now.
    pub fn on_ready(&mut self, callback: ReadyCallback<C>) -> Option<ReadyCallback<C>> {
        if self.is_synced() {
            Some(callback)
        } else {
            self.ready.push(callback);
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    pub fn transition(&mut self, synced: bool) -> Transition {
        let next = if synced {
            SyncState::Synced
        } else {
            SyncState::Unsynced
        };
        if next == self.state {
            return Transition::Unchanged;
        }

        debug!("Sync state {:?} -> {:?}", self.state, next);
        self.state = next;
        match next {
            SyncState::Synced => Transition::Synced,
            SyncState::Unsynced => Transition::Unsynced,
        }
    }

    /// Take the queued callbacks in registration order.
    pub fn take_ready(&mut self) -> Vec<ReadyCallback<C>> {
        std::mem::take(&mut self.ready)
    }

    /// Drop every queued callback.
    pub fn clear(&mut self) {
        self.ready.clear();
    }
}
