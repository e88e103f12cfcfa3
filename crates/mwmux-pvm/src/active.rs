//! Active requests: tracking state on requests whose responses have not
//! yet arrived.
//!
//! Every produced request registers one entry here, keyed by its id, so
//! the response consumer can find it. `deliver_response` decides the
//! response's fate: copied into the latch and the waiter completed, or
//! silently dropped (fire-and-forget, or the waiter was interrupted and
//! abandoned the request).

use mwmux_proto::message::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{PvmError, Result};
use crate::instance::SockInstance;

/// Outcome waiting in the latch.
enum Arrival {
    None,
    Response(Message),
    /// The ring died; every waiter is released with this.
    Terminal,
}

pub struct ActiveRequest {
    pub id: u64,
    /// Will a waiter consume the response? Cleared on interruption so the
    /// consumer drops the late arrival.
    pub deliver_response: AtomicBool,
    /// Interrupted waiters leave this set so a racing completion still
    /// reads as interrupted.
    interrupted: AtomicBool,
    latch: Mutex<Arrival>,
    arrived: Condvar,
    /// Back-reference to the owning socket; re-acquired by upgrade, the
    /// instance map stays the one strong owner.
    pub sockinst: Weak<SockInstance>,
}

impl ActiveRequest {
    /// Complete the latch. Called exactly once, by the response consumer.
    pub fn complete(&self, msg: Message) {
        let mut latch = self.latch.lock().unwrap();
        *latch = Arrival::Response(msg);
        drop(latch);
        self.arrived.notify_all();
    }

    /// Release the waiter with a terminal error (pending-exit).
    pub fn complete_terminal(&self) {
        let mut latch = self.latch.lock().unwrap();
        *latch = Arrival::Terminal;
        drop(latch);
        self.arrived.notify_all();
    }

    /// Abandon the request: the waiter stops caring and the late response
    /// will be dropped.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.deliver_response.store(false, Ordering::Release);
        self.arrived.notify_all();
    }

    /// Block until the response arrives, the request is interrupted, or
    /// `timeout` (when given) expires.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut latch = self.latch.lock().unwrap();
        loop {
            if self.interrupted.load(Ordering::Acquire) {
                return Err(PvmError::Interrupted);
            }
            match std::mem::replace(&mut *latch, Arrival::None) {
                Arrival::Response(msg) => return Ok(msg),
                Arrival::Terminal => return Err(PvmError::RingDown),
                Arrival::None => {}
            }
            latch = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PvmError::Timeout);
                    }
                    self.arrived.wait_timeout(latch, deadline - now).unwrap().0
                }
                None => self.arrived.wait(latch).unwrap(),
            };
        }
    }
}

/// All in-flight requests, keyed by id. Also the id allocator: ids are
/// process-wide, monotonic, and never 0.
pub struct ActiveRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<ActiveRequest>>>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_id(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            // Wrapped after 2^64 requests; skip the reserved value.
            self.next_id.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Allocate and register an entry for a new request.
    pub fn register(
        &self,
        deliver_response: bool,
        sockinst: Weak<SockInstance>,
    ) -> Arc<ActiveRequest> {
        let id = self.next_id();
        let entry = Arc::new(ActiveRequest {
            id,
            deliver_response: AtomicBool::new(deliver_response),
            interrupted: AtomicBool::new(false),
            latch: Mutex::new(Arrival::None),
            arrived: Condvar::new(),
            sockinst,
        });
        self.entries
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&entry));
        entry
    }

    /// Remove and return the entry for an arriving response id.
    pub fn take(&self, id: u64) -> Option<Arc<ActiveRequest>> {
        self.entries.lock().unwrap().remove(&id)
    }

    /// Unregister without completion (rollback after ring-full).
    pub fn unregister(&self, id: u64) {
        self.entries.lock().unwrap().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Release every waiter with a terminal error and clear the registry.
    /// Used when the ring enters pending-exit.
    pub fn fail_all(&self) {
        let drained: Vec<Arc<ActiveRequest>> =
            self.entries.lock().unwrap().drain().map(|(_, v)| v).collect();
        for entry in drained {
            entry.complete_terminal();
        }
    }
}

impl Default for ActiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
