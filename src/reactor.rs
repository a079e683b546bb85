//! Main reactor accept path.
//!
//! The main reactor polls only the listener. Every accepted socket is
//! pinned to a sub-reactor chosen by the load balancer and installed there
//! through that loop's trigger queue; the main reactor never owns a
//! connection. A trigger that can no longer be delivered drops the captured
//! connection, which closes the fd.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::connection::Conn;
use crate::errors::Result;
use crate::eventloop::EventLoop;
use crate::listener::{apply_stream_options, Listener};

/// Drain the accept queue and hand each new connection to a sub-reactor.
pub(crate) fn accept_new_connections(el: &mut EventLoop, ln: &Arc<Listener>) -> Result<()> {
    loop {
        match ln.accept() {
            Ok((stream, addr)) => {
                if el.svr().shutdown_requested() {
                    // Stop dispatching once shutdown is signaled; dropping
                    // the stream closes the accepted fd.
                    trace!(peer = %addr, "dropping accept during shutdown");
                    continue;
                }

                if let Err(e) = stream
                    .set_nonblocking(true)
                    .and_then(|()| apply_stream_options(&stream, &el.svr().opts))
                {
                    warn!(peer = %addr, error = %e, "failed to prepare accepted socket");
                    continue;
                }

                let target = el.svr().lb.next(addr);
                let conn = Conn::new_tcp(stream, addr, target.poller().clone());
                let fd = conn.fd();
                debug!(peer = %addr, fd, target = target.idx(), "dispatching connection");

                let res = target.poller().trigger(move |sub| {
                    if let Err(e) = sub.register_conn(conn) {
                        warn!(fd, error = %e, "failed to install dispatched connection");
                    }
                    Ok(())
                });
                if let Err(e) = res {
                    warn!(fd, error = %e, "target loop unavailable, dropping connection");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if is_fd_pressure(&e) {
                    // Out of descriptors; back off instead of spinning.
                    warn!(error = %e, "accept backpressure");
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                error!(error = %e, "main reactor accept failed");
                break;
            }
        }
    }
    Ok(())
}

fn is_fd_pressure(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE || code == libc::ENFILE
    )
}
