//! Shared header layout.
//!
//! Both VMs compile this file (different toolchains), so the layout is
//! expressed as explicit byte offsets into page 0, not as a Rust struct:
//!
//! ```text
//! 0x00: magic       u32
//! 0x04: slot_count  u32
//! 0x08: req_prod    u32   written by PVM, read by INS
//! 0x0c: req_cons    u32   written by INS, read by PVM
//! 0x10: rsp_prod    u32   written by INS, read by PVM
//! 0x14: rsp_cons    u32   written by PVM, read by INS
//! 0x18: req_notify  u32   INS parked, wants an event on request produce
//! 0x1c: rsp_notify  u32   PVM parked, wants an event on response produce
//! ```
//!
//! Indices are free-running; the slot index is `value & (slot_count - 1)`.
//! The slot array starts at the second page.

use crate::error::RingError;
use mwmux_proto::config::{PAGE_SIZE, SLOT_SIZE};

pub const RING_MAGIC: u32 = 0x4d57_524e; // "MWRN"

pub const OFF_MAGIC: usize = 0x00;
pub const OFF_SLOT_COUNT: usize = 0x04;
pub const OFF_REQ_PROD: usize = 0x08;
pub const OFF_REQ_CONS: usize = 0x0c;
pub const OFF_RSP_PROD: usize = 0x10;
pub const OFF_RSP_CONS: usize = 0x14;
pub const OFF_REQ_NOTIFY: usize = 0x18;
pub const OFF_RSP_NOTIFY: usize = 0x1c;

pub const SLOT_ARRAY_OFFSET: usize = PAGE_SIZE;

/// Slot capacity for a region of `len` bytes: whatever fits after the
/// header page, rounded down to a power of two so indices wrap by mask.
pub fn capacity_for(len: usize) -> Result<u32, RingError> {
    if len <= SLOT_ARRAY_OFFSET {
        return Err(RingError::RegionTooSmall(len));
    }
    let raw = (len - SLOT_ARRAY_OFFSET) / SLOT_SIZE;
    if raw < 2 {
        return Err(RingError::RegionTooSmall(len));
    }
    let mut cap = 1usize;
    while cap * 2 <= raw {
        cap *= 2;
    }
    Ok(cap as u32)
}
