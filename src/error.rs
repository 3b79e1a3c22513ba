use std::fmt;

use crate::target::TargetRef;

/// A fault reported by the log service for a single remote call.
///
/// `status` mirrors the HTTP-like status the service attached, when it
/// attached one. Whether the fault is worth retrying is decided by
/// [`crate::retry::classify`], not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub status: Option<u16>,
    pub message: String,
}

impl ServiceError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn without_status(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ServiceError {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("remote error: {0}")]
    Remote(#[from] ServiceError),
    #[error("{op} against {target} failed after {attempts} attempt(s)")]
    Exhausted {
        op: &'static str,
        target: TargetRef,
        attempts: u32,
        #[source]
        source: ServiceError,
    },
    #[error("failed over from {from} to {to}")]
    FailedOver { from: TargetRef, to: TargetRef },
    #[error("secondary resolution failed: {0}")]
    Resolution(String),
    #[error("registry persistence failed: {0}")]
    Persistence(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cannot build client for {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
}

impl Error {
    /// True when the error means the active target was abandoned and any
    /// target-scoped state (cursors) must be rebuilt.
    pub fn is_failover(&self) -> bool {
        matches!(self, Error::FailedOver { .. })
    }

    /// This error followed by each of its causes, joined with `": "`.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

pub type Result<T> = std::result::Result<T, Error>;
