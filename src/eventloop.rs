//! The event loop: one thread, one poller, one connection map.
//!
//! `EventLoop` is the thread-owned half: nothing outside the owning thread
//! ever touches it directly; cross-thread work arrives as trigger tasks.
//! `LoopHandle` is the shareable half, registered with the load balancer:
//! the loop index, the poller handle, and the connection count.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use mio::event::Event;
use tracing::{debug, error, trace, warn};

use crate::codec::Codec;
use crate::config;
use crate::connection::Conn;
use crate::errors::{Error, Result};
use crate::handler::{Action, EventHandler};
use crate::listener::{apply_stream_options, Listener};
use crate::netpoll::{Poller, PollerHandle};
use crate::reactor;
use crate::server::ServerCore;

/// The shareable face of an event loop.
///
/// Held by the load balancer and by anything that needs to submit work to
/// the loop. The index is assigned at balancer registration time; the main
/// reactor carries `-1` and is never registered.
pub(crate) struct LoopHandle {
    idx: AtomicI32,
    poller: PollerHandle,
    conn_count: AtomicUsize,
}

impl LoopHandle {
    pub(crate) fn new(poller: PollerHandle) -> LoopHandle {
        LoopHandle {
            idx: AtomicI32::new(0),
            poller,
            conn_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_idx(&self, idx: i32) {
        self.idx.store(idx, Ordering::Relaxed);
    }

    pub(crate) fn idx(&self) -> i32 {
        self.idx.load(Ordering::Relaxed)
    }

    pub(crate) fn poller(&self) -> &PollerHandle {
        &self.poller
    }

    /// Connections currently owned by the loop. Updated only by the owning
    /// thread; readers (least-connections balancing) tolerate staleness.
    pub(crate) fn conn_count(&self) -> usize {
        self.conn_count.load(Ordering::Relaxed)
    }

    fn incr_conn_count(&self) {
        self.conn_count.fetch_add(1, Ordering::Relaxed);
    }

    fn decr_conn_count(&self) {
        self.conn_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Thread-owned loop state.
pub(crate) struct EventLoop {
    handle: Arc<LoopHandle>,
    ln: Option<Arc<Listener>>,
    connections: HashMap<RawFd, Conn>,
    buffer: Vec<u8>,
    svr: Arc<ServerCore>,
    handler: Arc<dyn EventHandler>,
}

impl EventLoop {
    pub(crate) fn new(
        handle: Arc<LoopHandle>,
        ln: Option<Arc<Listener>>,
        svr: Arc<ServerCore>,
    ) -> EventLoop {
        let buffer = vec![0u8; svr.opts.read_buffer_cap];
        let handler = Arc::clone(&svr.handler);
        EventLoop {
            handle,
            ln,
            connections: HashMap::new(),
            buffer,
            svr,
            handler,
        }
    }

    pub(crate) fn svr(&self) -> &Arc<ServerCore> {
        &self.svr
    }

    /// Dispatch one readiness event.
    ///
    /// Known fds are connections: faults close them, writability flushes,
    /// readability reads. Anything else is this loop's listener.
    pub(crate) fn handle_event(&mut self, fd: RawFd, event: &Event) -> Result<()> {
        if self.connections.contains_key(&fd) {
            if event.is_error() {
                let err = io::Error::new(io::ErrorKind::Other, "socket error event");
                return self.loop_close_conn(fd, Some(err.into()));
            }
            if event.is_writable() {
                self.loop_write(fd)?;
            }
            if self.connections.contains_key(&fd)
                && (event.is_readable() || event.is_read_closed())
            {
                return self.loop_read(fd);
            }
            return Ok(());
        }
        self.loop_accept(fd)
    }

    /// Readiness on a listener fd: accept new streams or drain datagrams.
    fn loop_accept(&mut self, fd: RawFd) -> Result<()> {
        let Some(ln) = self.ln.clone() else {
            trace!(fd, idx = self.handle.idx(), "event for unknown fd");
            return Ok(());
        };
        if fd != ln.fd() {
            trace!(fd, idx = self.handle.idx(), "event for unknown fd");
            return Ok(());
        }
        if ln.network().is_udp() {
            return self.loop_read_udp(&ln);
        }
        if self.handle.idx() < 0 {
            return reactor::accept_new_connections(self, &ln);
        }

        loop {
            match ln.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.install_stream(stream, addr) {
                        warn!(peer = %addr, error = %e, "failed to install connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(idx = self.handle.idx(), error = %e, "accept failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn install_stream(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream.set_nonblocking(true)?;
        apply_stream_options(&stream, &self.svr.opts)?;
        let conn = Conn::new_tcp(stream, addr, self.handle.poller().clone());
        debug!(idx = self.handle.idx(), peer = %addr, fd = conn.fd(), "accepted connection");
        self.register_conn(conn)
    }

    /// Install a connection into this loop: arm read interest, insert into
    /// the map, and run the open callback. On registration failure the
    /// connection is dropped, closing its fd.
    pub(crate) fn register_conn(&mut self, conn: Conn) -> Result<()> {
        let fd = conn.fd();
        self.handle.poller().add_read(fd)?;
        self.connections.insert(fd, conn);
        self.handle.incr_conn_count();
        self.loop_open(fd)
    }

    fn loop_open(&mut self, fd: RawFd) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let codec = Arc::clone(&self.svr.codec);
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        let (out, action) = handler.on_opened(conn);
        if let Some(out) = out {
            if let Err(e) = codec.encode(conn, out).and_then(|buf| conn.write(&buf)) {
                return self.loop_close_conn(fd, Some(e));
            }
        }
        self.apply_action(fd, action)
    }

    /// Drain the socket, decode frames, dispatch `react`.
    fn loop_read(&mut self, fd: RawFd) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        let codec = Arc::clone(&self.svr.codec);

        loop {
            let Some(conn) = self.connections.get_mut(&fd) else {
                return Ok(());
            };
            let n = match conn.read(&mut self.buffer) {
                Ok(0) => return self.loop_close_conn(fd, None),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.loop_close_conn(fd, Some(e.into())),
            };
            conn.inbound_mut().extend_from_slice(&self.buffer[..n]);

            loop {
                let Some(conn) = self.connections.get_mut(&fd) else {
                    return Ok(());
                };
                let frame = match codec.decode(conn.inbound_mut()) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => return self.loop_close_conn(fd, Some(e)),
                };
                let (out, action) = handler.react(&frame, conn);
                if let Some(out) = out {
                    if let Err(e) = codec.encode(conn, out).and_then(|buf| conn.write(&buf)) {
                        return self.loop_close_conn(fd, Some(e));
                    }
                }
                match action {
                    Action::None => {}
                    Action::Close => return self.loop_close_conn(fd, None),
                    Action::Shutdown => self.svr.signal_shutdown(),
                }
            }
        }
    }

    fn loop_write(&mut self, fd: RawFd) -> Result<()> {
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        if let Err(e) = conn.flush() {
            return self.loop_close_conn(fd, Some(e));
        }
        Ok(())
    }

    /// Drain pending datagrams on the loop's UDP socket. Each datagram is a
    /// frame; replies go straight back out with `send_to`.
    fn loop_read_udp(&mut self, ln: &Arc<Listener>) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        loop {
            match ln.recv_from(&mut self.buffer) {
                Ok((n, peer)) => {
                    let mut conn =
                        Conn::new_udp(ln.clone(), peer, self.handle.poller().clone());
                    let (out, action) = handler.react(&self.buffer[..n], &mut conn);
                    if let Some(out) = out {
                        if let Err(e) = conn.write(&out) {
                            warn!(peer = %peer, error = %e, "udp reply failed");
                        }
                    }
                    if action == Action::Shutdown {
                        self.svr.signal_shutdown();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(idx = self.handle.idx(), error = %e, "udp read failed");
                    return Ok(());
                }
            }
        }
    }

    /// Encode and write `data` on behalf of a [`ConnSender`](crate::ConnSender)
    /// trigger. A vanished connection is a silent no-op.
    pub(crate) fn enqueue_write(&mut self, fd: RawFd, data: Vec<u8>) -> Result<()> {
        let codec = Arc::clone(&self.svr.codec);
        let Some(conn) = self.connections.get_mut(&fd) else {
            return Ok(());
        };
        if let Err(e) = codec.encode(conn, data).and_then(|buf| conn.write(&buf)) {
            return self.loop_close_conn(fd, Some(e));
        }
        Ok(())
    }

    /// Remove a connection: deregister, drop (closing the fd), and run the
    /// close callback.
    pub(crate) fn loop_close_conn(&mut self, fd: RawFd, err: Option<Error>) -> Result<()> {
        let Some(mut conn) = self.connections.remove(&fd) else {
            return Ok(());
        };
        if let Err(e) = self.handle.poller().delete(fd) {
            debug!(fd, error = %e, "deregister failed");
        }
        self.handle.decr_conn_count();
        let action = self.handler.on_closed(&mut conn, err.as_ref());
        if action == Action::Shutdown {
            self.svr.signal_shutdown();
        }
        debug!(idx = self.handle.idx(), fd, "connection closed");
        Ok(())
    }

    fn apply_action(&mut self, fd: RawFd, action: Action) -> Result<()> {
        match action {
            Action::None => Ok(()),
            Action::Close => self.loop_close_conn(fd, None),
            Action::Shutdown => {
                self.svr.signal_shutdown();
                Ok(())
            }
        }
    }

    fn close_all_connections(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            let _ = self.loop_close_conn(fd, None);
        }
    }
}

/// Run one event loop to completion on the current thread.
///
/// The shutdown sentinel exits cleanly; any other poller fault terminates
/// this loop only. Either way, every connection still owned by the loop is
/// closed (with its close callback) before the thread returns.
pub(crate) fn run(mut poller: Poller, mut el: EventLoop, lock_os_thread: bool) {
    let idx = el.handle.idx();
    if lock_os_thread {
        if let Err(e) = pin_to_core(idx.max(0) as usize % config::num_cpus()) {
            warn!(idx, error = %e, "failed to pin loop thread");
        }
    }

    match poller.polling(&mut el) {
        Err(Error::ServerShutdown) => debug!(idx, "event loop stopping"),
        Err(e) => error!(idx, error = %e, "event loop terminated"),
        Ok(()) => {}
    }

    el.close_all_connections();
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) -> io::Result<()> {
    Ok(())
}
