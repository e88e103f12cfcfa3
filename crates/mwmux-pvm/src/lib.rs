//! # mwmux-pvm — The protected VM side
//!
//! Userspace in the PVM sees mwsockets: opaque handles that behave like
//! sockets but whose implementation lives across the ring in the INS.
//! This crate owns everything between that handle surface and the ring:
//!
//! - request id assignment and request/response correlation (`active`);
//! - per-handle state: pending errno, latched SIGPIPE, poll events,
//!   accept-child preallocation (`instance`);
//! - the write-then-read device discipline, response post-processing, and
//!   close/rundown (`mwsocket`, `state`);
//! - the poll monitor that asks the INS for readiness and wakes local
//!   `poll()` waiters (`monitor`);
//! - the netflow backchannel boundary (`backchannel`).

pub mod active;
pub mod backchannel;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod mwsocket;
pub mod state;

pub use error::{PvmError, Result};
pub use instance::SockInstance;
pub use mwsocket::Mwsocket;
pub use state::{Pvm, PvmConfig, PvmState};
