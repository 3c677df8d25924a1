//! Signal/slot surface for pool events.
//!
//! A small observer mechanism carrying the pool's `drain` and `error`
//! events. Slots are invoked directly on the thread that emits — for pool
//! events that is the controller thread — so they must be `Send + Sync`
//! and quick.
//!
//! # Example
//!
//! ```
//! use lagoon::Signal;
//!
//! let drained = Signal::<()>::new();
//! let id = drained.connect(|_| println!("queue drained"));
//! drained.emit(());
//! drained.disconnect(id);
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// A unique identifier for a signal-slot connection.
    ///
    /// Use this ID to disconnect a specific connection via
    /// [`Signal::disconnect`].
    pub struct ConnectionId;
}

type Slot<Args> = Arc<dyn Fn(&Args) + Send + Sync>;

/// A signal with any number of connected slots.
///
/// Emitting invokes every connected slot with a reference to the argument,
/// in connection order.
pub struct Signal<Args> {
    connections: Mutex<SlotMap<ConnectionId, Slot<Args>>>,
}

impl<Args> Signal<Args> {
    /// Create a signal with no connections.
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Connect a slot; returns an id usable with [`disconnect`](Self::disconnect).
    pub fn connect<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.connections.lock().insert(Arc::new(slot))
    }

    /// Disconnect a slot by id.
    ///
    /// Returns `true` if the connection was found and removed.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(id).is_some()
    }

    /// Number of connected slots.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Invoke every connected slot.
    pub fn emit(&self, args: Args) {
        // Snapshot so slots may connect/disconnect reentrantly
        let slots: Vec<Slot<Args>> = self.connections.lock().values().cloned().collect();
        for slot in slots {
            slot(&args);
        }
    }
}

impl<Args> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args> fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("connections", &self.connection_count())
            .finish()
    }
}
