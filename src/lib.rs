//! gantry: event-driven TCP/UDP server framework.
//!
//! gantry serves tens of thousands of concurrent connections from a small
//! pool of single-threaded event loops. Each loop owns a kernel poller
//! (epoll/kqueue via mio) and a connection map; incoming connections are
//! spread across the loops either by per-loop listeners with `SO_REUSEPORT`
//! (distributed mode) or by a main reactor that accepts and dispatches to
//! sub-reactors (the default for TCP). Cross-thread work always travels
//! through a loop's wakeup-backed trigger queue, so connection state is
//! only ever touched by its owning thread.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use gantry::{serve, Action, Conn, EventHandler, Options};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
//!         (Some(frame.to_vec()), Action::None)
//!     }
//! }
//!
//! fn main() -> Result<(), gantry::Error> {
//!     let options = Options {
//!         multicore: true,
//!         ..Default::default()
//!     };
//!     serve(Echo, "tcp://127.0.0.1:9000", options)
//! }
//! ```
//!
//! # Topologies
//!
//! - **Reactor** (TCP default): a main reactor owns the listener, accepts,
//!   and hands each connection to a sub-reactor picked by the configured
//!   load balancer.
//! - **Distributed** (`reuse_port`, and always for UDP): every loop owns a
//!   listener bound to the same address and the kernel spreads accepts.
//!
//! Handlers run on loop threads and must not block; long-running work
//! belongs elsewhere, with results flowing back through [`ConnSender`].

mod codec;
mod config;
mod connection;
mod errors;
mod eventloop;
mod handler;
mod listener;
mod loadbalancer;
mod netpoll;
mod reactor;
mod server;

pub use codec::{Codec, LengthFieldFrameCodec, LineBasedFrameCodec, Passthrough};
pub use config::{LoadBalancing, Options};
pub use connection::{Conn, ConnSender};
pub use errors::{Error, Result};
pub use handler::{Action, EventHandler, Server};
pub use listener::Network;
pub use server::{add_tcp_connector, serve, serve_arc, shutdown, ConnFd};
