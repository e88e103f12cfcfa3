//! Per-mwsocket instance state.
//!
//! One of these exists per live handle. It carries everything the PVM must
//! remember between syscalls: the remote handle, the deferred error and
//! SIGPIPE latches, the latest readiness reported by the poll monitor, and
//! the accept-child preallocated while an Accept is in flight.
//!
//! The instance map in `PvmState` is the one strong owner; everything else
//! (active requests) holds weak references.

use mwmux_core::Semaphore;
use mwmux_proto::handle::{self, MwSocket};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::active::ActiveRequest;

pub struct SockInstance {
    /// Local handle value handed to user space. Never collides with a
    /// host fd range.
    pub local_id: u32,
    /// Remote (INS) handle; `handle::INVALID` until the Create or Accept
    /// response arrives.
    remote_fd: AtomicU32,
    /// O_NONBLOCK mirror.
    pub nonblocking: AtomicBool,
    /// Latest events reported by the poll monitor; read-and-cleared by
    /// the per-handle poll callback.
    pub poll_events: AtomicU16,
    /// Error encountered on the INS not yet delivered to the caller.
    /// 0 means none; otherwise a negative canonical errno.
    pub pending_errno: AtomicI32,
    pub pending_sigpipe: AtomicBool,
    pub delivered_sigpipe: AtomicBool,
    /// Creation + open active requests.
    pub refct: AtomicU32,
    /// Did the user's write announce a read to follow?
    pub read_expected: AtomicBool,
    /// Id of the blocking request. Only one at a time.
    pub blockid: AtomicU64,
    /// The remote side observed a close on this socket.
    pub remote_close_requested: AtomicBool,
    pub release_started: AtomicBool,
    /// Serializes Send/Shutdown/Close per handle; taken when the request
    /// is produced, released by the response path.
    pub oplock: Semaphore,
    /// Preallocated accept child; valid only while the single in-flight
    /// Accept against this instance is outstanding.
    pub child: Mutex<Option<Arc<SockInstance>>>,
    /// The active request the announced read will wait on. Held here (not
    /// looked up) because the consumer unregisters the id on arrival.
    pub blockreq: Mutex<Option<Arc<ActiveRequest>>>,
}

impl SockInstance {
    pub fn new(local_id: u32) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            remote_fd: AtomicU32::new(handle::INVALID),
            nonblocking: AtomicBool::new(false),
            poll_events: AtomicU16::new(0),
            pending_errno: AtomicI32::new(0),
            pending_sigpipe: AtomicBool::new(false),
            delivered_sigpipe: AtomicBool::new(false),
            refct: AtomicU32::new(1),
            read_expected: AtomicBool::new(false),
            blockid: AtomicU64::new(0),
            remote_close_requested: AtomicBool::new(false),
            release_started: AtomicBool::new(false),
            oplock: Semaphore::new(1),
            child: Mutex::new(None),
            blockreq: Mutex::new(None),
        })
    }

    pub fn remote_fd(&self) -> MwSocket {
        self.remote_fd.load(Ordering::Acquire)
    }

    pub fn set_remote_fd(&self, fd: MwSocket) {
        self.remote_fd.store(fd, Ordering::Release);
    }

    pub fn has_remote(&self) -> bool {
        self.remote_fd() != handle::INVALID
    }

    /// Consume the pending errno latch, if set.
    pub fn take_pending_errno(&self) -> Option<i32> {
        let v = self.pending_errno.swap(0, Ordering::AcqRel);
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }

    /// Consume the SIGPIPE latch. True at most once per latch-set: the
    /// delivered flag stays up until the latch is re-armed.
    pub fn take_pending_sigpipe(&self) -> bool {
        if self.pending_sigpipe.swap(false, Ordering::AcqRel) {
            !self.delivered_sigpipe.swap(true, Ordering::AcqRel)
        } else {
            false
        }
    }

    /// Arm the SIGPIPE latch (remote close observed on a send path).
    pub fn latch_sigpipe(&self) {
        self.pending_sigpipe.store(true, Ordering::Release);
    }

    pub fn get_ref(&self) {
        self.refct.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference; true when this was the last one.
    pub fn put_ref(&self) -> bool {
        self.refct.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Atomically read and clear the monitor-reported events.
    pub fn take_poll_events(&self) -> u16 {
        self.poll_events.swap(0, Ordering::AcqRel)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_has_no_remote() {
        let inst = SockInstance::new(1000);
        assert!(!inst.has_remote());
        inst.set_remote_fd(handle::encode(1, 3));
        assert!(inst.has_remote());
        assert_eq!(handle::decode(inst.remote_fd()), (1, 3));
    }

    #[test]
    fn test_pending_errno_consumed_once() {
        let inst = SockInstance::new(1000);
        assert_eq!(inst.take_pending_errno(), None);
        inst.pending_errno.store(-104, Ordering::Release);
        assert_eq!(inst.take_pending_errno(), Some(-104));
        assert_eq!(inst.take_pending_errno(), None);
    }

    #[test]
    fn test_sigpipe_delivered_at_most_once() {
        let inst = SockInstance::new(1000);
        assert!(!inst.take_pending_sigpipe());
        inst.latch_sigpipe();
        assert!(inst.take_pending_sigpipe());
        // Latch re-armed after delivery still reports false: one SIGPIPE
        // per socket lifetime.
        inst.latch_sigpipe();
        assert!(!inst.take_pending_sigpipe());
    }

    #[test]
    fn test_refcount() {
        let inst = SockInstance::new(1000);
        inst.get_ref();
        assert!(!inst.put_ref());
        assert!(inst.put_ref());
    }

    #[test]
    fn test_poll_events_read_and_clear() {
        let inst = SockInstance::new(1000);
        inst.poll_events.store(0x5, Ordering::Release);
        assert_eq!(inst.take_poll_events(), 0x5);
        assert_eq!(inst.take_poll_events(), 0);
    }
}
