//! # mwmux-proto — Wire protocol types
//!
//! The messages that cross the shared ring between the protected VM and the
//! isolated network stack, plus everything both sides must agree on byte for
//! byte: the packed little-endian header, the opcode pairs, the mwsocket
//! handle encoding, the canonical errno numbering, and the wire sockaddr.
//!
//! These types are the *lingua franca* between all mwmux components. The two
//! sides are built by different toolchains in different VMs, so nothing in
//! here may depend on Rust layout: every struct has an explicit byte-level
//! encode/decode and the constants are fixed by this crate alone.

pub mod attrib;
pub mod config;
pub mod errno;
pub mod handle;
pub mod message;
pub mod payload;
pub mod sockaddr;

pub use handle::MwSocket;
pub use message::{Message, MsgHeader, Opcode};
pub use sockaddr::WireSockAddrIn;
