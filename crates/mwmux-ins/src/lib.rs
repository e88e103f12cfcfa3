//! # mwmux-ins — The isolated network stack side
//!
//! One dispatcher thread reads requests off the shared ring, validates and
//! classifies them, and either executes them inline (operations that do not
//! block meaningfully) or hands them to the worker bound to the target
//! socket. Each worker is an OS thread married to at most one live host
//! socket; blocking host calls run there without holding up the ring.
//!
//! ```text
//! ring ──> dispatcher ──┬── inline: Create / PollsetQuery / Shutdown /
//!                       │           Close / Bind / Listen / Attrib
//!                       └── worker FIFO: Connect / Send / Accept / Recv /
//!                                        RecvFrom / GetSockName / GetPeerName
//! ```
//!
//! Handle low 16 bits == worker slot index; that lookup is the whole
//! routing table.

pub mod bufferpool;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod pollset;
pub mod pool;
pub mod state;

pub use error::{InsError, Result};
pub use state::{Ins, InsConfig, InsShared};
