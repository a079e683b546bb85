//! Error types shared across the framework.
//!
//! `Error::ServerShutdown` is not a fault: it is the control signal that
//! makes an event loop's poll iteration unwind back to `loop_run` and exit.

use std::io;

use thiserror::Error;

/// Errors surfaced by the framework.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket or poller I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The proto address had an unknown scheme (expected tcp/tcp4/tcp6/udp/udp4/udp6).
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The bind or connect address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddr(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No server is registered under the given proto address.
    #[error("no server bound to {0}")]
    ServerNotFound(String),

    /// A connector handle did not carry a usable fd/sockaddr pair.
    #[error("connector handle of unexpected shape: {0}")]
    TypeMismatch(String),

    /// Sentinel: the server is shutting down and the observing loop must exit.
    #[error("server is going to be shut down")]
    ServerShutdown,
}

impl Error {
    /// Whether this error is the shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::ServerShutdown)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_sentinel() {
        assert!(Error::ServerShutdown.is_shutdown());
        let io_err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(!io_err.is_shutdown());
    }
}
