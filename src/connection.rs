//! Per-connection state.
//!
//! A `Conn` is owned by exactly one event loop and only ever touched on that
//! loop's thread. The write path is direct-write-first: bytes go to the
//! socket immediately and only the unwritten tail is queued, with write
//! interest armed until the queue drains. Other threads reach a connection
//! through [`ConnSender`], which routes through the owning loop's trigger
//! queue.

use std::any::Any;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::errors::Result;
use crate::listener::Listener;
use crate::netpoll::PollerHandle;

enum Sock {
    Tcp(TcpStream),
    /// Transient datagram pseudo-connection: replies go straight out via
    /// `send_to` on the loop's socket.
    Udp {
        ln: Arc<Listener>,
        peer: SocketAddr,
    },
}

/// One client connection, pinned to its owning event loop.
pub struct Conn {
    fd: RawFd,
    sock: Sock,
    poller: PollerHandle,
    inbound: BytesMut,
    outbound: BytesMut,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    ctx: Option<Box<dyn Any + Send>>,
}

impl Conn {
    pub(crate) fn new_tcp(
        stream: TcpStream,
        remote_addr: SocketAddr,
        poller: PollerHandle,
    ) -> Conn {
        let fd = stream.as_raw_fd();
        let local_addr = stream.local_addr().ok();
        Conn {
            fd,
            sock: Sock::Tcp(stream),
            poller,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            local_addr,
            remote_addr: Some(remote_addr),
            ctx: None,
        }
    }

    pub(crate) fn new_udp(ln: Arc<Listener>, peer: SocketAddr, poller: PollerHandle) -> Conn {
        let fd = ln.fd();
        let local_addr = Some(ln.lnaddr());
        Conn {
            fd,
            sock: Sock::Udp { ln, peer },
            poller,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            local_addr,
            remote_addr: Some(peer),
            ctx: None,
        }
    }

    /// Kernel file descriptor of the underlying socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Peer address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Local address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether this is a transient datagram connection.
    pub fn is_udp(&self) -> bool {
        matches!(self.sock, Sock::Udp { .. })
    }

    /// Attach an opaque application value to this connection.
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    /// Borrow the attached context, if any.
    pub fn context<T: Any + Send>(&self) -> Option<&T> {
        self.ctx.as_ref().and_then(|c| c.downcast_ref())
    }

    /// Mutably borrow the attached context, if any.
    pub fn context_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut().and_then(|c| c.downcast_mut())
    }

    /// Take the attached context out of the connection.
    pub fn take_context<T: Any + Send>(&mut self) -> Option<Box<T>> {
        match self.ctx.take() {
            Some(c) => match c.downcast() {
                Ok(t) => Some(t),
                Err(c) => {
                    self.ctx = Some(c);
                    None
                }
            },
            None => None,
        }
    }

    /// Handle for sending to this connection from other threads.
    ///
    /// Only meaningful for TCP connections; datagram pseudo-connections are
    /// gone by the time a trigger could reach them.
    pub fn sender(&self) -> ConnSender {
        ConnSender {
            fd: self.fd,
            poller: self.poller.clone(),
        }
    }

    pub(crate) fn inbound_mut(&mut self) -> &mut BytesMut {
        &mut self.inbound
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.sock {
            Sock::Tcp(stream) => stream.read(buf),
            Sock::Udp { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "read on a datagram connection",
            )),
        }
    }

    /// Send `data`, queueing whatever the socket will not take right now.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.sock {
            Sock::Udp { ln, peer } => {
                ln.send_to(data, *peer)?;
                Ok(())
            }
            Sock::Tcp(stream) => {
                if !self.outbound.is_empty() {
                    // Keep byte order: everything goes behind the queue.
                    self.outbound.extend_from_slice(data);
                    return Ok(());
                }
                let mut written = 0;
                while written < data.len() {
                    match stream.write(&data[written..]) {
                        Ok(0) => {
                            return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                        }
                        Ok(n) => written += n,
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.outbound.extend_from_slice(&data[written..]);
                            self.poller.mod_write(self.fd)?;
                            return Ok(());
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        }
    }

    /// Flush the outbound queue; restores read-only interest once drained.
    pub(crate) fn flush(&mut self) -> Result<()> {
        let Sock::Tcp(stream) = &mut self.sock else {
            return Ok(());
        };
        while !self.outbound.is_empty() {
            match stream.write(&self.outbound) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.poller.mod_read(self.fd)?;
        Ok(())
    }
}

/// Cross-thread sender for a TCP connection.
///
/// `send` is expressed as a trigger on the owning loop: the payload is
/// encoded with the server's codec and written on the loop thread, so it
/// never races connection state.
#[derive(Clone)]
pub struct ConnSender {
    fd: RawFd,
    poller: PollerHandle,
}

impl ConnSender {
    /// Queue `data` for sending on the owning loop.
    ///
    /// Succeeds as a no-op when the connection is already gone; fails with
    /// the shutdown sentinel when the owning loop has exited.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        let fd = self.fd;
        self.poller.trigger(move |el| el.enqueue_write(fd, data))
    }
}
