//! Event-channel wake abstraction.
//!
//! The ring only ever uses the inter-VM event channel as a doorbell. A
//! producer signals it when the peer has flagged itself parked; the peer's
//! binding turns the interrupt into a semaphore post. Signals are
//! coalesced: N signals before the consumer wakes may yield one wakeup.
//!
//! **Contract:** `signal()` must never block.

use mwmux_core::Semaphore;
use std::sync::Arc;

pub trait EventChannel: Send + Sync {
    /// Ring the peer's doorbell.
    fn signal(&self);
}

/// A semaphore that doubles as an event-channel endpoint: signaling it is
/// posting it. This is both the loopback implementation and the delivery
/// target a real event-channel IRQ callback posts into.
pub struct EventSem {
    sem: Arc<Semaphore>,
}

impl EventSem {
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn sem(&self) -> Arc<Semaphore> {
        Arc::clone(&self.sem)
    }
}

impl Default for EventSem {
    fn default() -> Self {
        Self::new()
    }
}

impl EventChannel for EventSem {
    fn signal(&self) {
        self.sem.post();
    }
}

/// Discards signals. Used by tests that drive the ring synchronously.
pub struct NullChannel;

impl EventChannel for NullChannel {
    fn signal(&self) {}
}
