//! PVM-side error types.
//!
//! Errors raised here never enter the ring; they use the local OS's error
//! vocabulary. Errors arriving from the INS are already canonical and are
//! carried through `RemoteError` untranslated.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PvmError {
    /// Ring is full or the oplock could not be taken without blocking.
    WouldBlock,
    /// Malformed request, or read without a preceding write.
    InvalidArgument,
    /// Handle is not an mwsocket or the instance is gone.
    BadHandle,
    /// The blocking wait was interrupted; the late response will be
    /// dropped by the consumer.
    Interrupted,
    /// Bounded wait on a response expired.
    Timeout,
    /// The ring entered the pending-exit state; terminal.
    RingDown,
    /// The INS failed the operation: negative canonical errno, passed
    /// through untranslated.
    RemoteError(i32),
}

impl PvmError {
    /// The local errno a kernel driver would surface for this error.
    pub fn as_errno(&self) -> i32 {
        match self {
            PvmError::WouldBlock => libc::EAGAIN,
            PvmError::InvalidArgument => libc::EINVAL,
            PvmError::BadHandle => libc::EBADF,
            PvmError::Interrupted => libc::EINTR,
            PvmError::Timeout => libc::ETIMEDOUT,
            PvmError::RingDown => libc::EIO,
            PvmError::RemoteError(e) => -e,
        }
    }
}

impl fmt::Display for PvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvmError::WouldBlock => write!(f, "operation would block"),
            PvmError::InvalidArgument => write!(f, "invalid argument"),
            PvmError::BadHandle => write!(f, "not an mwsocket"),
            PvmError::Interrupted => write!(f, "interrupted"),
            PvmError::Timeout => write!(f, "response timed out"),
            PvmError::RingDown => write!(f, "ring in pending-exit state"),
            PvmError::RemoteError(e) => write!(f, "remote errno {}", -e),
        }
    }
}

impl std::error::Error for PvmError {}

pub type Result<T> = std::result::Result<T, PvmError>;
