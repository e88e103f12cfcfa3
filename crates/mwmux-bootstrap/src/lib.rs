//! # mwmux-bootstrap — Out-of-band handshake
//!
//! Before the ring exists the two VMs can only talk through a hierarchical
//! string key-value store (read/write/remove/watch on named paths) and the
//! hypervisor's grant and event-channel primitives. This crate drives that
//! bootstrap to completion:
//!
//! - the PVM runs the *server* side: publish its domain id, wait for an INS
//!   to announce itself, allocate an event-channel port and the shared
//!   pages, publish both;
//! - the INS runs the *client* side: announce itself, map the published
//!   grants, bind the published port, mark itself bound.
//!
//! The hypervisor primitives are trait seams (`GrantOffer`, `GrantMap`,
//! `EventChannelAlloc`, `EventChannelBind`) with in-process loopback
//! implementations, so everything above this crate is testable without Xen.

pub mod error;
pub mod grant;
pub mod handshake;
pub mod keys;
pub mod keystore;
pub mod loopback;

pub use error::{BootstrapError, Result};
pub use grant::{DomId, EventChannelAlloc, EventChannelBind, GrantOffer, GrantMap};
pub use handshake::{InsHandshake, InsSession, PvmHandshake, PvmSession};
pub use keystore::{KeyStore, MemStore, WatchEvent};
