//! Error types for framelink.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using framelink's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for framelink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An invalid handle, key or argument was passed to an API.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The backing store could not be created, truncated or mapped.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// A named object (segment or gate) does not exist, usually because the
    /// owning side already released it.
    #[error("no such shared object: {0}")]
    NotFound(String),

    /// The auxiliary descriptor socket is not established.
    #[error("descriptor channel not connected")]
    NotConnected,

    /// An event ring is saturated.
    #[error("event queue full")]
    QueueFull,

    /// The operation is not valid in the current lifecycle state.
    #[error("{operation} not accepted in state {state}")]
    UnacceptedState {
        /// State the controller was in.
        state: &'static str,
        /// Operation that was refused.
        operation: &'static str,
    },

    /// The descriptor kind cannot be sent to another process.
    #[error("descriptor cannot be transferred: {0}")]
    UnsupportedTransfer(String),

    /// The child did not complete its handshake in time.
    #[error("frameserver did not signal readiness within {0:?}")]
    SpawnTimeout(Duration),

    /// The OS refused to move a descriptor across the socket.
    #[error("descriptor transfer failed: {0}")]
    TransferFailed(String),

    /// The object was already released.
    #[error("no such object")]
    NoSuchObject,

    /// The shared page failed validation (bad magic, version, or cursors).
    #[error("shared page corrupted: {0}")]
    Corrupted(String),

    /// The peer process is gone; a blocked gate was force-released.
    #[error("peer process is gone")]
    PeerGone,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Whether this error means the shared page can no longer be trusted.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, Error::Corrupted(_) | Error::PeerGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaccepted_state_message() {
        let err = Error::UnacceptedState {
            state: "Dead",
            operation: "resume",
        };
        assert_eq!(err.to_string(), "resume not accepted in state Dead");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Corrupted("cursor".into()).is_fatal_to_session());
        assert!(Error::PeerGone.is_fatal_to_session());
        assert!(!Error::QueueFull.is_fatal_to_session());
        assert!(!Error::NotConnected.is_fatal_to_session());
    }
}
