//! INS-side error types.

use mwmux_ring::RingError;
use std::fmt;

#[derive(Debug)]
pub enum InsError {
    /// Ring transport failure (fatal variants shut the INS down).
    Ring(RingError),
    /// All worker slots are in use.
    WorkersExhausted,
    /// All request buffer slots are in use.
    BuffersExhausted,
    /// Host OS error.
    Os(nix::errno::Errno),
    /// Failed to spawn a subsystem thread.
    Spawn(std::io::Error),
}

impl fmt::Display for InsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsError::Ring(e) => write!(f, "ring: {}", e),
            InsError::WorkersExhausted => write!(f, "worker pool exhausted"),
            InsError::BuffersExhausted => write!(f, "buffer pool exhausted"),
            InsError::Os(e) => write!(f, "host error: {}", e),
            InsError::Spawn(e) => write!(f, "thread spawn failed: {}", e),
        }
    }
}

impl std::error::Error for InsError {}

impl From<RingError> for InsError {
    fn from(e: RingError) -> Self {
        InsError::Ring(e)
    }
}

impl From<nix::errno::Errno> for InsError {
    fn from(e: nix::errno::Errno) -> Self {
        InsError::Os(e)
    }
}

pub type Result<T> = std::result::Result<T, InsError>;
