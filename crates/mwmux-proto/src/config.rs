//! Protocol constants agreed by both VMs at compile time.
//!
//! Changing any of these changes the wire/shared-memory contract; both sides
//! must be rebuilt together.

use std::time::Duration;

/// Page size assumed for the granted region.
pub const PAGE_SIZE: usize = 4096;

/// Size of one ring slot. Must hold the largest request or response,
/// power of two.
pub const SLOT_SIZE: usize = 4096;

/// Bytes of payload a single message can carry.
pub const MAX_PAYLOAD: usize = SLOT_SIZE - crate::message::HEADER_LEN;

/// Number of ring slots. Power of two so indices wrap by mask.
pub const RING_SLOT_COUNT: usize = 64;

/// Pages in the granted region: one header page plus the slot array.
pub const GRANT_REF_COUNT: usize = 1 + RING_SLOT_COUNT * SLOT_SIZE / PAGE_SIZE;

/// Max number of INS worker threads. This is the same as the max number of
/// concurrent sockets the INS can hold open. Must be >= 2 to function.
pub const MAX_WORKER_COUNT: usize = 500;

/// Number of request buffer slots on the INS. Accounts for each worker
/// blocking plus headroom for inline requests.
pub const BUFFER_ITEM_COUNT: usize = MAX_WORKER_COUNT + 50;

/// How long an accepted-but-idle connection is held by the defer-accept
/// warming pool before it is reaped.
pub const DEFER_ACCEPT_MAX_IDLE: Duration = Duration::from_secs(10);

/// Poll monitor tick on the PVM.
pub const POLL_MONITOR_INTERVAL: Duration = Duration::from_millis(125);

/// How long the poll monitor waits for a PollsetQuery response.
pub const POLL_MONITOR_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded wait on the response to a user-visible Close, and the rundown
/// per-socket budget.
pub const GENERAL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_count_power_of_two() {
        assert!(RING_SLOT_COUNT.is_power_of_two());
    }

    #[test]
    fn test_region_is_whole_pages() {
        assert_eq!((RING_SLOT_COUNT * SLOT_SIZE) % PAGE_SIZE, 0);
        assert_eq!(GRANT_REF_COUNT, 65);
    }

    #[test]
    fn test_worker_index_fits_handle() {
        // Handle encoding reserves 16 bits for the worker index.
        assert!(MAX_WORKER_COUNT < u16::MAX as usize);
    }
}
