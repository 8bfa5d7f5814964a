//! Subscriber lists for multiplexer events.
//!
//! A [`Signal`] holds an ordered list of callbacks. `emit` runs them
//! synchronously, in registration order, on the emitting thread. The list is
//! copied before invocation so a callback may subscribe or unsubscribe
//! without deadlocking.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::connection::ConnectionId;
use crate::sync::lock;

/// Handle returned by [`Signal::connect`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An event with any number of subscribers.
pub struct Signal<T> {
    slots: Mutex<Vec<(SubscriptionId, Slot<T>)>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    /// Create a signal with no subscribers.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe a callback.
    pub fn connect<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.slots).push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was not subscribed.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        slots.len() != before
    }

    /// Number of subscribers.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber with `value`.
    ///
    /// A panicking subscriber is logged and skipped; the emitting thread
    /// (event loop or dispatcher) keeps running.
    pub fn emit(&self, value: &T) {
        let slots: Vec<Slot<T>> = lock(&self.slots)
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();

        for slot in slots {
            if panic::catch_unwind(AssertUnwindSafe(|| slot(value))).is_err() {
                tracing::error!("event subscriber panicked");
            }
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of the `connected` and `disconnected` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Connection identifier.
    pub connection: ConnectionId,
    /// Remote address.
    pub addr: SocketAddr,
}

/// Payload of the `received` and `transmitted` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEvent {
    /// Connection the bytes came from or went to.
    pub connection: ConnectionId,
    /// One complete frame as it appears on the wire.
    pub data: Bytes,
}

/// The four multiplexer events.
#[derive(Default)]
pub struct Events {
    /// A client connection was accepted (event-loop thread).
    pub connected: Signal<ConnectionEvent>,
    /// A client connection was closed (event-loop thread).
    pub disconnected: Signal<ConnectionEvent>,
    /// A complete frame arrived (dispatcher thread).
    pub received: Signal<DataEvent>,
    /// A queued item was fully written (event-loop thread).
    pub transmitted: Signal<DataEvent>,
}
