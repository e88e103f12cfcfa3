//! Fixed pool of request buffer slots.
//!
//! A buffer slot carries one consumed request from the dispatcher to a
//! worker. Ownership is the `in_use` CAS: whoever flips it false->true owns
//! the slot until it releases it. The slot body is only ever touched by the
//! current owner, so the inner mutex never contends.

use mwmux_proto::message::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct BufferSlot {
    in_use: AtomicBool,
    msg: Mutex<Option<Message>>,
}

pub struct BufferPool {
    slots: Vec<BufferSlot>,
}

impl BufferPool {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|_| BufferSlot {
                in_use: AtomicBool::new(false),
                msg: Mutex::new(None),
            })
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot. Returns its index, or None when every slot is
    /// owned (the dispatcher yields and retries).
    pub fn reserve(&self) -> Option<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Store the consumed request into an owned slot.
    pub fn fill(&self, idx: usize, msg: Message) {
        debug_assert!(self.slots[idx].in_use.load(Ordering::Relaxed));
        *self.slots[idx].msg.lock().unwrap() = Some(msg);
    }

    /// Take the request out of an owned slot (worker side).
    pub fn take(&self, idx: usize) -> Option<Message> {
        self.slots[idx].msg.lock().unwrap().take()
    }

    pub fn release(&self, idx: usize) {
        *self.slots[idx].msg.lock().unwrap() = None;
        self.slots[idx].in_use.store(false, Ordering::Release);
    }

    /// How many slots are currently free. Diagnostic only.
    pub fn free_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.in_use.load(Ordering::Relaxed))
            .count()
    }
}

// ============================================================================
// Tests
// ============================================================================
