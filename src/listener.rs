//! Listening sockets and proto-address parsing.
//!
//! A proto address looks like `tcp://127.0.0.1:9000` or `udp6://[::1]:5353`;
//! a bare `host:port` is TCP. Sockets are built with socket2 so reuse flags
//! and buffer sizes can be applied before bind, then handed over as plain
//! non-blocking std sockets.

use std::io;
use std::net::{self, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tracing::debug;

use crate::config::Options;
use crate::errors::{Error, Result};

/// Transport and address-family constraint parsed from the proto address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    /// Whether this network is datagram-based.
    pub fn is_udp(&self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    fn from_scheme(scheme: &str) -> Option<Network> {
        match scheme {
            "tcp" => Some(Network::Tcp),
            "tcp4" => Some(Network::Tcp4),
            "tcp6" => Some(Network::Tcp6),
            "udp" => Some(Network::Udp),
            "udp4" => Some(Network::Udp4),
            "udp6" => Some(Network::Udp6),
            _ => None,
        }
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp | Network::Udp => true,
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        };
        f.write_str(s)
    }
}

/// Split a proto address into its network and `host:port` part.
pub(crate) fn parse_proto_addr(proto_addr: &str) -> Result<(Network, String)> {
    match proto_addr.split_once("://") {
        Some((scheme, addr)) => {
            let network = Network::from_scheme(scheme)
                .ok_or_else(|| Error::UnsupportedProtocol(scheme.to_string()))?;
            Ok((network, addr.to_string()))
        }
        None => Ok((Network::Tcp, proto_addr.to_string())),
    }
}

/// Resolve `addr` to the first socket address matching the network's family.
pub(crate) fn resolve_addr(network: Network, addr: &str) -> Result<SocketAddr> {
    let mut candidates = addr
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddr(format!("{addr}: {e}")))?;
    candidates
        .find(|a| network.accepts(a))
        .ok_or_else(|| Error::InvalidAddr(format!("{addr}: no {network} address")))
}

enum ListenerSock {
    Tcp(net::TcpListener),
    Udp(net::UdpSocket),
}

/// A bound, non-blocking listening socket.
pub(crate) struct Listener {
    network: Network,
    addr: String,
    lnaddr: SocketAddr,
    sock: ListenerSock,
}

impl Listener {
    pub(crate) fn network(&self) -> Network {
        self.network
    }

    /// The `host:port` string the listener was created from.
    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    /// The resolved local address (real port even when binding port 0).
    pub(crate) fn lnaddr(&self) -> SocketAddr {
        self.lnaddr
    }

    pub(crate) fn fd(&self) -> RawFd {
        match &self.sock {
            ListenerSock::Tcp(l) => l.as_raw_fd(),
            ListenerSock::Udp(s) => s.as_raw_fd(),
        }
    }

    /// Accept one pending TCP connection.
    pub(crate) fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.sock {
            ListenerSock::Tcp(l) => l.accept(),
            ListenerSock::Udp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept on a datagram listener",
            )),
        }
    }

    /// Receive one pending datagram.
    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match &self.sock {
            ListenerSock::Udp(s) => s.recv_from(buf),
            ListenerSock::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv_from on a stream listener",
            )),
        }
    }

    /// Send one datagram to `peer`.
    pub(crate) fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        match &self.sock {
            ListenerSock::Udp(s) => s.send_to(buf, peer),
            ListenerSock::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send_to on a stream listener",
            )),
        }
    }
}

/// Create a bound listener for `network` on `addr`.
///
/// Reuse-addr is always set; reuse-port only when the options ask for it
/// (distributed mode binds one listener per loop to the same address).
pub(crate) fn init_listener(network: Network, addr: &str, opts: &Options) -> Result<Listener> {
    let sockaddr = resolve_addr(network, addr)?;
    let domain = Domain::for_address(sockaddr);

    let (ty, proto) = if network.is_udp() {
        (Type::DGRAM, Protocol::UDP)
    } else {
        (Type::STREAM, Protocol::TCP)
    };

    let socket = Socket::new(domain, ty, Some(proto))?;
    socket.set_reuse_address(true)?;
    if opts.reuse_port {
        socket.set_reuse_port(true)?;
    }
    if opts.socket_recv_buffer > 0 {
        socket.set_recv_buffer_size(opts.socket_recv_buffer)?;
    }
    if opts.socket_send_buffer > 0 {
        socket.set_send_buffer_size(opts.socket_send_buffer)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&sockaddr.into())?;

    let sock = if network.is_udp() {
        ListenerSock::Udp(socket.into())
    } else {
        socket.listen(1024)?;
        ListenerSock::Tcp(socket.into())
    };

    let lnaddr = match &sock {
        ListenerSock::Tcp(l) => l.local_addr()?,
        ListenerSock::Udp(s) => s.local_addr()?,
    };
    debug!(network = %network, addr = %lnaddr, "listener bound");

    Ok(Listener {
        network,
        addr: addr.to_string(),
        lnaddr,
        sock,
    })
}

/// Apply the per-stream socket options to an accepted or connected socket.
pub(crate) fn apply_stream_options(stream: &TcpStream, opts: &Options) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(opts.tcp_nodelay)?;
    if opts.tcp_keepalive > 0 {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(opts.tcp_keepalive));
        sock.set_tcp_keepalive(&keepalive)?;
    }
    if opts.socket_recv_buffer > 0 {
        sock.set_recv_buffer_size(opts.socket_recv_buffer)?;
    }
    if opts.socket_send_buffer > 0 {
        sock.set_send_buffer_size(opts.socket_send_buffer)?;
    }
    Ok(())
}

/// Open a TCP connection with the configured socket options applied, for
/// handing to a running server as a pre-connected socket.
pub(crate) fn tcp_connect(
    network: Network,
    addr: &str,
    opts: &Options,
) -> Result<(TcpStream, SocketAddr)> {
    let sockaddr = resolve_addr(network, addr)?;
    let stream = TcpStream::connect(sockaddr).map_err(Error::Io)?;
    apply_stream_options(&stream, opts)?;
    stream.set_nonblocking(true)?;
    Ok((stream, sockaddr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proto_addr() {
        let (network, addr) = parse_proto_addr("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(network, Network::Tcp);
        assert_eq!(addr, "127.0.0.1:9000");

        let (network, _) = parse_proto_addr("udp6://[::1]:5353").unwrap();
        assert_eq!(network, Network::Udp6);

        let (network, addr) = parse_proto_addr("127.0.0.1:9000").unwrap();
        assert_eq!(network, Network::Tcp);
        assert_eq!(addr, "127.0.0.1:9000");

        assert!(matches!(
            parse_proto_addr("quic://127.0.0.1:1"),
            Err(Error::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_family_constraint() {
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        assert!(Network::Tcp.accepts(&v4) && Network::Tcp.accepts(&v6));
        assert!(Network::Tcp4.accepts(&v4) && !Network::Tcp4.accepts(&v6));
        assert!(!Network::Udp6.accepts(&v4) && Network::Udp6.accepts(&v6));
    }

    #[test]
    fn test_bind_ephemeral_tcp() {
        let opts = Options::default();
        let ln = init_listener(Network::Tcp, "127.0.0.1:0", &opts).unwrap();
        assert!(ln.lnaddr().port() != 0);
        assert!(!ln.network().is_udp());
        assert!(ln.fd() >= 0);
    }

    #[test]
    fn test_bind_ephemeral_udp() {
        let opts = Options::default();
        let ln = init_listener(Network::Udp, "127.0.0.1:0", &opts).unwrap();
        assert!(ln.network().is_udp());
        assert!(ln.lnaddr().port() != 0);
    }
}
