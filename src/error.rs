//! Error taxonomy shared by device adapters and the media path

use std::time::Duration;
use thiserror::Error;

/// Failure of a device command or status query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Network-level failure (connect refused, reset, timeout). Retryable.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The device answered, but the reply was malformed or a rejection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation has no meaning for this kind of device.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// No device is registered under the requested id.
    #[error("device not found: {0}")]
    NotFound(String),
}

impl DeviceError {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Command round-trip exceeded its bound.
    pub fn timed_out(after: Duration) -> Self {
        Self::Unreachable(format!("no reply within {:?}", after))
    }

    /// Only transient network failures may be retried, and only for idempotent queries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            Self::Unreachable(e.to_string())
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        Self::Unreachable(e.to_string())
    }
}

/// Failure on the streaming side: session lookup, range resolution, upstream reads.
///
/// `Clone` so one in-flight upstream fetch can hand its outcome to every reader
/// waiting on the same window.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("session not found")]
    SessionNotFound,

    #[error("session expired")]
    SessionExpired,

    #[error("requested range not satisfiable")]
    RangeNotSatisfiable { length: Option<u64> },

    /// Sequential-only source already has its single reader.
    #[error("source already has an active reader")]
    ConcurrencyLimit,

    #[error("upstream stalled for {0:?}")]
    UpstreamStalled(Duration),

    #[error("upstream fetch failed: {0}")]
    Upstream(String),

    #[error("read cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(String),
}

impl StreamError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}
