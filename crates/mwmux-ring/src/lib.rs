//! # mwmux-ring — Shared-ring transport
//!
//! A bounded request/response ring laid out over a run of pages shared
//! between the two VMs, single-producer/single-consumer in each direction:
//! the PVM produces requests and consumes responses (the *front* ring), the
//! INS consumes requests and produces responses (the *back* ring).
//!
//! Page 0 holds the shared header (four free-running indices plus the two
//! notification flags); the slot array starts at page 1. Slots are reused
//! only once the response that last occupied them has been consumed, which
//! is what makes a single slot array safe for both directions.
//!
//! Wakeups travel over an event channel and are edge-coalesced: a consumer
//! that finds nothing must re-park, and a consumer that finds items must
//! drain them all before re-parking.

pub mod error;
pub mod layout;
pub mod notify;
pub mod region;
pub mod ring;

pub use error::{RingError, Result};
pub use notify::{EventChannel, EventSem};
pub use region::SharedRegion;
pub use ring::{BackRing, FrontRing};
