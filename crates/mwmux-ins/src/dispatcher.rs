//! The dispatcher thread.
//!
//! Single consumer of the request ring. Each request is parked in a buffer
//! slot, classified, and either handled inline or queued to the worker the
//! handle's low 16 bits name. Send/Shutdown/Close additionally take the
//! socket's oplock here, before the operation is admitted, which is what
//! serializes them against each other per handle.

use mwmux_core::{mw_debug, mw_error, mw_warn};
use mwmux_proto::attrib::AttribRequest;
use mwmux_proto::errno;
use mwmux_proto::message::{Message, Opcode};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::engine;
use crate::pollset;
use crate::state::InsShared;

pub fn dispatcher_loop(shared: Arc<InsShared>) {
    mwmux_core::log::set_thread_tag("ins:disp");
    mw_debug!("dispatcher up, ring capacity {}", shared.ring.capacity());

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let msg = match shared.ring.consume_request() {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                shared
                    .consumer_sem
                    .wait_timeout(Duration::from_millis(100));
                continue;
            }
            Err(e) => {
                // Validation failure is fatal for the ring; stop consuming.
                mw_error!("request ring fatal: {}", e);
                break;
            }
        };
        route(&shared, msg);
    }

    // Make sure parked workers observe the end.
    shared.shutdown.store(true, Ordering::Release);
    for slot in &shared.workers {
        slot.wake.post();
    }
    mw_debug!("dispatcher down");
}

fn is_global_attrib(msg: &Message) -> bool {
    AttribRequest::decode(&msg.payload).map_or(false, |a| a.name.is_global())
}

fn route(shared: &Arc<InsShared>, msg: Message) {
    // decode() only admits recognized opcodes.
    let Some(op) = msg.opcode() else {
        return;
    };

    // Every request occupies a buffer slot for as long as the INS holds
    // it. None free means every worker is saturated; spin gently, the
    // ring itself is the backpressure the PVM sees.
    let bidx = loop {
        match shared.buffers.reserve() {
            Some(idx) => break idx,
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                thread::yield_now();
            }
        }
    };

    match op {
        Opcode::Create => {
            let resp = engine::create(shared, &msg);
            shared.produce_response(&resp);
            shared.buffers.release(bidx);
        }

        Opcode::PollsetQuery => {
            let resp = pollset::query(shared, &msg);
            shared.produce_response(&resp);
            shared.buffers.release(bidx);
        }

        Opcode::Invalid => {
            let resp = engine::respond(&msg.header, -errno::MW_EINVAL, vec![]);
            shared.produce_response(&resp);
            shared.buffers.release(bidx);
        }

        Opcode::Attrib if is_global_attrib(&msg) => {
            let resp = engine::attrib(shared, None, &msg);
            shared.produce_response(&resp);
            shared.buffers.release(bidx);
        }

        _ => route_to_worker(shared, op, msg, bidx),
    }

    // Scheduler hint: connection setup benefits from an actual sleep so
    // the accepting/connecting worker runs before the next request.
    match op {
        Opcode::Connect | Opcode::Accept => thread::sleep(Duration::from_millis(1)),
        _ => thread::yield_now(),
    }
}

fn route_to_worker(shared: &Arc<InsShared>, op: Opcode, msg: Message, bidx: usize) {
    let Some(slot) = shared.find_worker(msg.header.sockfd) else {
        mw_warn!("{:?} for unknown handle {:#010x}", op, msg.header.sockfd);
        let resp = engine::respond(&msg.header, -errno::MW_EBADF, vec![]);
        shared.produce_response(&resp);
        shared.buffers.release(bidx);
        return;
    };

    // Serialize Send/Shutdown/Close per socket. Blocks the dispatcher
    // until the previous serialized op on this handle completed.
    if op.needs_oplock() {
        slot.oplock.wait();
    }

    if op.runs_inline() {
        let resp = engine::execute(shared, &slot, &msg);
        shared.produce_response(&resp);
        shared.buffers.release(bidx);
        if op.needs_oplock() {
            slot.oplock.post();
        }
        if op == Opcode::Close {
            // Anything still queued for this worker targets a socket that
            // no longer exists; answer it before the slot can be reused.
            while let Some(stale_idx) = slot.queue.pop() {
                if let Some(stale) = shared.buffers.take(stale_idx) {
                    let resp = engine::respond(&stale.header, -errno::MW_EBADF, vec![]);
                    shared.produce_response(&resp);
                }
                shared.buffers.release(stale_idx);
            }
            shared.release_worker(&slot);
        }
        return;
    }

    // Blocking op: park it on the worker's FIFO.
    shared.buffers.fill(bidx, msg);
    match slot.queue.push(bidx) {
        Ok(()) => slot.wake.post(),
        Err(rejected_idx) => {
            // FIFO full; bounce the request instead of stalling the ring.
            if let Some(stale) = shared.buffers.take(rejected_idx) {
                let resp = engine::respond(&stale.header, -errno::MW_EAGAIN, vec![]);
                shared.produce_response(&resp);
            }
            shared.buffers.release(rejected_idx);
            if op.needs_oplock() {
                slot.oplock.post();
            }
        }
    }
}
