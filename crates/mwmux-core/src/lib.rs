//! # mwmux-core
//!
//! Ambient runtime support shared by every mwmux crate.
//!
//! Nothing in here knows about sockets, rings, or VMs. It is the small
//! substrate the rest of the system stands on:
//!
//! - `log` - kernel-style leveled print macros, configured from `MW_*`
//!   environment variables
//! - `env` - environment variable parsing helpers
//! - `sem` - a counting semaphore used for consumer and worker parking

#![allow(dead_code)]

pub mod env;
pub mod log;
pub mod sem;

pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};
pub use sem::Semaphore;
