//! Lifecycle errors for the router, its registry and its connections.
//!
//! Protocol-level failures (bad messages, unknown types, handler panics)
//! never show up here: they are answered with an error envelope on the
//! connection that caused them.

use std::io;

use thiserror::Error;

use crate::reclaim::ReclaimError;

/// Errors surfaced to callers of the router API.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A handler is already registered for this message type.
    #[error("{0} task already registered")]
    DuplicateHandler(String),

    /// Handlers must be registered under a non-empty message type.
    #[error("message type must be a non-empty string")]
    InvalidType,

    /// `register_dispatcher` was called without a registry.
    #[error("a handler registry must be supplied to the dispatcher")]
    InvalidRegistry,

    /// The port is zero or not a number.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    /// Binding failed because another socket holds the port.
    #[error("port {port} is already in use: {source}")]
    AddressInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Force-listen could not evict the current occupant of the port.
    #[error("could not free port {port}: {source}")]
    PortFreeFailed {
        port: u16,
        #[source]
        source: ReclaimError,
    },

    /// `end` was called while no listener was active.
    #[error("not running, nothing done")]
    NotRunning,

    /// `process_message` was called before `register_dispatcher`.
    #[error("connection has no dispatcher registered")]
    NotDispatching,

    /// The socket is already owned by a dispatching connection.
    #[error("socket is already wrapped by a connection")]
    SocketInUse,

    /// The connection was destroyed or its peer went away.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Any other I/O failure while binding or accepting.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// OS error code carried by an `AddressInUse` error (`EADDRINUSE` on Unix).
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            RouterError::AddressInUse { source, .. } => source.raw_os_error(),
            RouterError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Result type alias using RouterError.
pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_handler_message() {
        let err = RouterError::DuplicateHandler("my-handler".to_string());
        assert_eq!(err.to_string(), "my-handler task already registered");
    }

    #[test]
    fn test_address_in_use_code() {
        let err = RouterError::AddressInUse {
            port: 4441,
            source: io::Error::from_raw_os_error(libc::EADDRINUSE),
        };
        assert_eq!(err.os_error_code(), Some(libc::EADDRINUSE));
        assert!(err.to_string().contains("4441"));
        assert_eq!(RouterError::NotRunning.os_error_code(), None);
    }
}
