//! Server configuration.
//!
//! `Options` carries everything `serve` needs to shape a server: loop count,
//! accept topology, socket options, buffer sizing, and the balancing policy.
//! All fields have working defaults, and the non-programmatic fields can be
//! loaded from a TOML document.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::codec::Codec;
use crate::errors::{Error, Result};

/// Policy used to map a new connection onto an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Cycle through the loops with an incrementing counter.
    #[default]
    RoundRobin,
    /// Pick the loop currently holding the fewest connections.
    LeastConnections,
    /// Hash the remote address so one peer always lands on the same loop.
    SourceAddrHash,
}

/// Server options.
///
/// Loop-count resolution follows [`Options::num_event_loops`]; everything
/// else is applied verbatim.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Size the loop pool to the CPU count.
    pub multicore: bool,
    /// Explicit loop count; wins over `multicore` when greater than zero.
    pub num_event_loop: usize,
    /// Bind one listener per loop with `SO_REUSEPORT` and let the kernel
    /// spread accepts (distributed mode).
    pub reuse_port: bool,
    /// Pin each loop thread to a CPU core.
    pub lock_os_thread: bool,
    /// Run the periodic tick callback.
    pub ticker: bool,
    /// Capacity of each loop's scratch read buffer in bytes.
    pub read_buffer_cap: usize,
    /// TCP keepalive interval in seconds; 0 disables.
    pub tcp_keepalive: u64,
    /// Set `TCP_NODELAY` on every stream.
    pub tcp_nodelay: bool,
    /// `SO_RCVBUF` for accepted/connected sockets; 0 keeps the kernel default.
    pub socket_recv_buffer: usize,
    /// `SO_SNDBUF` for accepted/connected sockets; 0 keeps the kernel default.
    pub socket_send_buffer: usize,
    /// Load balancing policy.
    pub lb: LoadBalancing,
    /// Frame codec; `None` means the passthrough codec.
    #[serde(skip)]
    pub codec: Option<Arc<dyn Codec>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            multicore: false,
            num_event_loop: 0,
            reuse_port: false,
            lock_os_thread: false,
            ticker: false,
            read_buffer_cap: default_read_buffer_cap(),
            tcp_keepalive: 0,
            tcp_nodelay: true,
            socket_recv_buffer: 0,
            socket_send_buffer: 0,
            lb: LoadBalancing::RoundRobin,
            codec: None,
        }
    }
}

fn default_read_buffer_cap() -> usize {
    64 * 1024
}

impl Options {
    /// Resolve the number of event loops to run.
    ///
    /// Defaults to 1; `multicore` raises it to the CPU count; an explicit
    /// `num_event_loop > 0` overrides both.
    pub fn num_event_loops(&self) -> usize {
        if self.num_event_loop > 0 {
            return self.num_event_loop;
        }
        if self.multicore {
            return num_cpus();
        }
        1
    }

    /// Parse options from a TOML document.
    ///
    /// The codec cannot be expressed in TOML and stays at its default.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("multicore", &self.multicore)
            .field("num_event_loop", &self.num_event_loop)
            .field("reuse_port", &self.reuse_port)
            .field("lock_os_thread", &self.lock_os_thread)
            .field("ticker", &self.ticker)
            .field("read_buffer_cap", &self.read_buffer_cap)
            .field("tcp_keepalive", &self.tcp_keepalive)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("socket_recv_buffer", &self.socket_recv_buffer)
            .field("socket_send_buffer", &self.socket_send_buffer)
            .field("lb", &self.lb)
            .field("codec", &self.codec.as_ref().map(|_| "custom"))
            .finish()
    }
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
