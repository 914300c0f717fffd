//! Error types shared across the protocol core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The remote attach was rejected or the target is gone.
    #[error("target {target} unreachable: {message}")]
    TargetUnreachable { target: String, message: String },

    /// The remote side refused the attach outright.
    #[error("permission denied for target {target}")]
    PermissionDenied { target: String },

    /// Mid-session I/O failure on the exec transport.
    #[error("transport broken: {0}")]
    TransportBroken(String),

    /// Malformed control message. Dropped by the receiver; the session
    /// keeps running.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Upload rejected before any bytes moved.
    #[error("upload validation failed: {0}")]
    UploadValidationFailed(String),

    /// Upload accepted but the transfer itself failed.
    #[error("upload transport failed: {0}")]
    UploadTransportFailed(String),

    /// Discovery lookup failed. Callers treat the target as absent for this
    /// lookup only; the answer is never cached.
    #[error("existence query failed: {0}")]
    QueryFailed(String),

    /// A target reference that is not of the form `namespace/name`.
    #[error("invalid target reference {0:?}, expected namespace/name")]
    InvalidTarget(String),

    /// Operation requires a session state it is not in.
    #[error("invalid session state: expected {expected}, actual {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl Error {
    /// Failures that should put a reconnection supervisor into its backoff
    /// loop.
    pub fn triggers_reconnect(&self) -> bool {
        matches!(
            self,
            Error::TargetUnreachable { .. } | Error::TransportBroken(_)
        )
    }

    /// Failures that must never be retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::TransportBroken(err.to_string())
    }
}
