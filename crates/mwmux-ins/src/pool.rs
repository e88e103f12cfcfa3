//! Fixed worker pool.
//!
//! One slot per potential socket. A slot binds an OS thread, a wake
//! semaphore, a FIFO of buffer-slot indices, and (while `in_use`) one live
//! host socket. The slot index is the low 16 bits of the socket's public
//! handle, so routing a request is a single array lookup.
//!
//! `in_use` transitions only by compare-and-swap. The oplock is a binary
//! semaphore acquired by the dispatcher when it admits a Send/Shutdown/
//! Close for the socket and released when that operation has produced its
//! response; this is what keeps a Close from racing an in-flight Send.

use crossbeam_queue::ArrayQueue;
use mwmux_core::{mw_trace, Semaphore};
use mwmux_proto::handle::{self, MwSocket};
use mwmux_proto::message::Opcode;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::engine;
use crate::pollset::WarmPool;
use crate::state::InsShared;

/// Host socket state while a worker slot is bound to one.
#[derive(Default)]
pub struct SockState {
    pub fd: Option<OwnedFd>,
    /// Canonical family/type as requested at Create.
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
    /// Populated by Bind.
    pub bound_port: Option<u16>,
    pub listening: bool,
    pub nonblocking: bool,
    pub defer_accept: bool,
    /// Has readable readiness ever been observed on this socket?
    pub saw_readable: bool,
    pub remote_closed: bool,
    /// Defer-accept warming pool; populated only on listeners.
    pub warm: WarmPool,
}

pub struct WorkerSlot {
    pub in_use: AtomicBool,
    pub idx: u16,
    /// Posted once per queued work item.
    pub wake: Semaphore,
    /// Binary semaphore; see module doc.
    pub oplock: Semaphore,
    /// Buffer-slot indices awaiting this worker, in arrival order.
    pub queue: ArrayQueue<usize>,
    /// The exported handle, or `handle::INVALID` while free.
    pub public_fd: AtomicU32,
    pub sock: Mutex<SockState>,
}

pub fn new_slots(count: usize, queue_depth: usize) -> Vec<Arc<WorkerSlot>> {
    (0..count)
        .map(|idx| {
            Arc::new(WorkerSlot {
                in_use: AtomicBool::new(false),
                idx: idx as u16,
                wake: Semaphore::new(0),
                oplock: Semaphore::new(1),
                queue: ArrayQueue::new(queue_depth),
                public_fd: AtomicU32::new(handle::INVALID),
                sock: Mutex::new(SockState::default()),
            })
        })
        .collect()
}

/// Claim a free slot for a new socket.
pub fn reserve(slots: &[Arc<WorkerSlot>]) -> Option<Arc<WorkerSlot>> {
    for slot in slots {
        if slot
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some(Arc::clone(slot));
        }
    }
    None
}

/// Resolve a request's sockfd to its worker: the handle must be well
/// formed, the slot live, and the stored public handle must match (a stale
/// handle from a closed socket fails the last check).
pub fn find(slots: &[Arc<WorkerSlot>], sockfd: MwSocket) -> Option<Arc<WorkerSlot>> {
    if !handle::is_mwsocket(sockfd) {
        return None;
    }
    let idx = handle::worker_index(sockfd) as usize;
    let slot = slots.get(idx)?;
    if !slot.in_use.load(Ordering::Acquire) {
        return None;
    }
    if slot.public_fd.load(Ordering::Acquire) != sockfd {
        return None;
    }
    Some(Arc::clone(slot))
}

/// Worker thread body: drain the FIFO, run the handler, produce the
/// response, release the buffer, release the oplock where the dispatcher
/// took it.
pub fn worker_loop(shared: Arc<InsShared>, slot: Arc<WorkerSlot>) {
    mwmux_core::log::set_thread_tag("ins:wrk");

    loop {
        slot.wake.wait_timeout(Duration::from_millis(200));
        if shared.shutdown.load(Ordering::Acquire) && slot.queue.is_empty() {
            break;
        }

        while let Some(bidx) = slot.queue.pop() {
            let msg = match shared.buffers.take(bidx) {
                Some(msg) => msg,
                None => {
                    shared.buffers.release(bidx);
                    continue;
                }
            };
            let op = msg.opcode();
            mw_trace!("worker {} handling {:?} id {}", slot.idx, op, msg.header.id);

            let resp = engine::execute(&shared, &slot, &msg);
            shared.produce_response(&resp);
            shared.buffers.release(bidx);

            if op.map_or(false, Opcode::needs_oplock) {
                slot.oplock.post();
            }
        }
    }
}

pub fn spawn_workers(shared: &Arc<InsShared>) -> std::io::Result<Vec<thread::JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(shared.workers.len());
    for slot in &shared.workers {
        let shared = Arc::clone(shared);
        let slot = Arc::clone(slot);
        let handle = thread::Builder::new()
            .name(format!("mw-ins-worker-{}", slot.idx))
            .spawn(move || worker_loop(shared, slot))?;
        handles.push(handle);
    }
    Ok(handles)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_marks_in_use() {
        let slots = new_slots(3, 8);
        let a = reserve(&slots).unwrap();
        assert_eq!(a.idx, 0);
        let b = reserve(&slots).unwrap();
        assert_eq!(b.idx, 1);
        assert!(a.in_use.load(Ordering::Relaxed));
        assert!(b.in_use.load(Ordering::Relaxed));
    }

    #[test]
    fn test_reserve_exhaustion() {
        let slots = new_slots(1, 8);
        let _a = reserve(&slots).unwrap();
        assert!(reserve(&slots).is_none());
    }

    #[test]
    fn test_find_validates_handle() {
        let slots = new_slots(4, 8);
        let slot = reserve(&slots).unwrap();
        let fd = handle::encode(1, slot.idx);
        slot.public_fd.store(fd, Ordering::Release);

        assert!(find(&slots, fd).is_some());
        // Plain integers are not handles.
        assert!(find(&slots, slot.idx as u32).is_none());
        // Stale handle with a different instance byte.
        assert!(find(&slots, handle::encode(2, slot.idx)).is_none());
        // Free slot.
        assert!(find(&slots, handle::encode(1, 3)).is_none());
        // Out of pool range.
        assert!(find(&slots, handle::encode(1, 400)).is_none());
    }

    #[test]
    fn test_oplock_is_binary() {
        let slots = new_slots(1, 8);
        let slot = &slots[0];
        assert!(slot.oplock.try_wait());
        assert!(!slot.oplock.try_wait());
        slot.oplock.post();
        assert!(slot.oplock.try_wait());
    }
}
