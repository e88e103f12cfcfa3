//! The poll monitor.
//!
//! The PVM never computes readiness locally; the INS is authoritative.
//! This thread ticks every ~125 ms, and if any instances exist it sends
//! one PollsetQuery, waits up to a second for the answer, repaints every
//! instance's `poll_events` from the reported list under the instance
//! lock, and does a single wake on the global wait queue.

use mwmux_core::{mw_debug, mw_trace};
use mwmux_proto::config::POLL_MONITOR_RESPONSE_TIMEOUT;
use mwmux_proto::message::{Message, Opcode};
use mwmux_proto::payload::decode_pollset;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PvmError;
use crate::state::PvmState;

pub fn monitor_loop(state: Arc<PvmState>, interval: Duration) {
    mwmux_core::log::set_thread_tag("pvm:poll");
    mw_debug!("poll monitor up, interval {:?}", interval);

    while !state.shutdown.load(Ordering::Acquire) {
        sleep_checked(&state, interval);
        if state.shutdown.load(Ordering::Acquire) {
            break;
        }
        if state.instance_count() == 0 {
            continue;
        }
        tick(&state);
    }
    mw_debug!("poll monitor down");
}

fn tick(state: &Arc<PvmState>) {
    let Ok(msg) = Message::request(Opcode::PollsetQuery, vec![]) else {
        return;
    };
    let actreq = match state.submit(None, msg, true) {
        Ok(actreq) => actreq,
        // Ring full: skip this tick, the next one retries.
        Err(PvmError::WouldBlock) => return,
        Err(_) => return,
    };

    let resp = match actreq.wait(Some(POLL_MONITOR_RESPONSE_TIMEOUT)) {
        Ok(resp) => resp,
        Err(PvmError::Timeout) => {
            // Abandon; the consumer drops the late report.
            actreq.interrupt();
            return;
        }
        Err(_) => return,
    };
    if resp.header.status < 0 {
        return;
    }

    let entries = decode_pollset(&resp.payload);
    mw_trace!("pollset: {} entries", entries.len());

    {
        let instances = state.instances.lock().unwrap();
        for inst in instances.values() {
            inst.poll_events.store(0, Ordering::Release);
        }
        for entry in &entries {
            if let Some(inst) = instances
                .values()
                .find(|i| i.remote_fd() == entry.sockfd)
            {
                inst.poll_events.store(entry.events, Ordering::Release);
            }
        }
    }

    // One wake per tick, regardless of how many handles changed.
    state.waitq.wake_all();
}

fn sleep_checked(state: &PvmState, total: Duration) {
    let tick = Duration::from_millis(25);
    let mut remaining = total;
    while !state.shutdown.load(Ordering::Acquire) && remaining > Duration::ZERO {
        let step = remaining.min(tick);
        std::thread::sleep(step);
        remaining -= step;
    }
}
