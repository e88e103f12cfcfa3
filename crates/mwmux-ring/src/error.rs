//! Ring transport error types.

use mwmux_proto::message::MsgError;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// No free slot; the caller surfaces EAGAIN and rolls back.
    Full,
    /// Region too small for a header page plus at least two slots.
    RegionTooSmall(usize),
    /// Header magic or slot count did not match at attach time.
    BadHeader,
    /// A dequeued message failed validation. Fatal: the ring has entered
    /// the pending-exit state.
    Corrupt(MsgError),
    /// The ring was declared corrupt earlier; all operations now fail.
    PendingExit,
    /// mmap failed with the given errno.
    MapFailed(i32),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::Full => write!(f, "ring full"),
            RingError::RegionTooSmall(n) => write!(f, "region of {} bytes too small", n),
            RingError::BadHeader => write!(f, "bad ring header"),
            RingError::Corrupt(e) => write!(f, "ring corrupt: {}", e),
            RingError::PendingExit => write!(f, "ring in pending-exit state"),
            RingError::MapFailed(e) => write!(f, "mmap failed: errno {}", e),
        }
    }
}

impl std::error::Error for RingError {}

pub type Result<T> = std::result::Result<T, RingError>;
