//! Bootstrap error types.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    /// Key-value store operation failed.
    Store(String),
    /// A published value did not parse (bad domid, bad grant list, ...).
    BadValue(String),
    /// Grant offer/map failed.
    Grant(String),
    /// Event-channel allocation or bind failed.
    EventChannel(String),
    /// The watched key never appeared within the caller's budget.
    Timeout(&'static str),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Store(s) => write!(f, "keystore: {}", s),
            BootstrapError::BadValue(s) => write!(f, "bad published value: {}", s),
            BootstrapError::Grant(s) => write!(f, "grant: {}", s),
            BootstrapError::EventChannel(s) => write!(f, "event channel: {}", s),
            BootstrapError::Timeout(k) => write!(f, "timed out waiting for {}", k),
        }
    }
}

impl std::error::Error for BootstrapError {}

pub type Result<T> = std::result::Result<T, BootstrapError>;
