//! User-facing event callbacks.
//!
//! Implement [`EventHandler`] and hand it to [`serve`](crate::serve). Every
//! callback runs on the thread of the event loop that owns the connection,
//! so handlers must not block; long work belongs on other threads, with
//! results fed back through a [`ConnSender`](crate::ConnSender).

use std::net::SocketAddr;
use std::time::Duration;

use crate::connection::Conn;
use crate::errors::Error;

/// What the core should do after a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Keep going.
    #[default]
    None,
    /// Close the connection the callback was invoked for.
    Close,
    /// Shut the whole server down.
    Shutdown,
}

/// Read-only view of a running server, passed to the lifecycle callbacks.
#[derive(Debug, Clone)]
pub struct Server {
    /// Resolved listen address (real port even when binding to port 0).
    pub addr: SocketAddr,
    /// Whether the loop pool was sized to the CPU count.
    pub multicore: bool,
    /// Number of worker event loops.
    pub num_event_loop: usize,
    /// Whether accepts are spread across per-loop listeners.
    pub reuse_port: bool,
    /// TCP keepalive interval in seconds; 0 when disabled.
    pub tcp_keepalive: u64,
}

/// Connection lifecycle and data callbacks.
///
/// All methods have default implementations, so a handler only spells out
/// what it cares about. `react` is the hot path: it receives one decoded
/// frame and may return bytes to send back on the same connection.
pub trait EventHandler: Send + Sync + 'static {
    /// The server is ready to accept connections (loops are not running
    /// yet). Returning [`Action::Shutdown`] aborts startup and `serve`
    /// returns `Ok(())` without spawning a single loop.
    fn on_init_complete(&self, _svr: &Server) -> Action {
        Action::None
    }

    /// The server is shutting down; fired once, before the loops are joined.
    fn on_shutdown(&self, _svr: &Server) {}

    /// A new connection was opened. Returned bytes are encoded with the
    /// configured codec and queued for sending.
    fn on_opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// A connection was closed. `err` carries the fault when the close was
    /// not clean.
    fn on_closed(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        Action::None
    }

    /// One decoded frame arrived. Returned bytes are encoded with the
    /// configured codec and sent on the same connection.
    fn react(&self, _frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (None, Action::None)
    }

    /// Periodic tick (only when `Options::ticker` is set). Returns the delay
    /// until the next tick and an optional control action.
    fn on_tick(&self) -> (Duration, Action) {
        (Duration::from_secs(1), Action::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl EventHandler for Noop {}

    #[test]
    fn test_default_callbacks() {
        let h = Noop;
        let view = Server {
            addr: "127.0.0.1:0".parse().unwrap(),
            multicore: false,
            num_event_loop: 1,
            reuse_port: false,
            tcp_keepalive: 0,
        };
        assert_eq!(h.on_init_complete(&view), Action::None);
        let (delay, action) = h.on_tick();
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(action, Action::None);
    }
}
