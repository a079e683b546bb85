//! Integration tests: real servers on loopback, driven over std sockets.
//!
//! Each test reserves an ephemeral port, serves on it from a background
//! thread, talks to the server with plain std TCP/UDP sockets, then shuts
//! it down through the registry and joins the serving thread.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use gantry::{
    add_tcp_connector, serve_arc, shutdown, Action, Conn, ConnFd, Error, EventHandler,
    LoadBalancing, Options, Server,
};

const WAIT: Duration = Duration::from_secs(10);

// ── Echo handler with lifecycle counters ───────────────────────────────

struct Echo {
    ready: Sender<SocketAddr>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    shutdowns: AtomicUsize,
    init_action: Action,
}

impl Echo {
    fn new(ready: Sender<SocketAddr>) -> Echo {
        Echo {
            ready,
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            init_action: Action::None,
        }
    }
}

impl EventHandler for Echo {
    fn on_init_complete(&self, svr: &Server) -> Action {
        let _ = self.ready.send(svr.addr);
        self.init_action
    }

    fn on_shutdown(&self, _svr: &Server) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn on_opened(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        self.opened.fetch_add(1, Ordering::SeqCst);
        (None, Action::None)
    }

    fn on_closed(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Action::None
    }

    fn react(&self, frame: &[u8], _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
        (Some(frame.to_vec()), Action::None)
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

fn reserve_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn reserve_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect_timeout(&addr, WAIT).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}

/// The registry entry appears shortly after `on_init_complete`; retry until
/// the server is visible.
fn shutdown_when_registered(proto: &str) {
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        match shutdown(proto) {
            Ok(()) => return,
            Err(_) if std::time::Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("server never registered: {e}"),
        }
    }
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    let mut read = 0;
    while read < n {
        let k = stream.read(&mut buf[read..]).unwrap();
        assert!(k > 0, "server closed the connection early");
        read += k;
    }
    buf
}

// ── Tests ──────────────────────────────────────────────────────────────

#[test]
fn test_tcp_echo_round_trip() {
    let port = reserve_tcp_port();
    let proto = format!("tcp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let handler = Arc::new(Echo::new(ready_tx));

    let options = Options {
        num_event_loop: 2,
        ..Default::default()
    };
    let serve_handler = Arc::clone(&handler);
    let serve_proto = proto.clone();
    let jh = thread::spawn(move || serve_arc(serve_handler, &serve_proto, options));

    let addr = ready_rx.recv_timeout(WAIT).unwrap();
    let mut stream = connect(addr);
    stream.write_all(b"hello").unwrap();
    assert_eq!(read_exact(&mut stream, 5), b"hello");
    drop(stream);

    shutdown_when_registered(&proto);
    jh.join().unwrap().unwrap();

    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(handler.opened.load(Ordering::SeqCst), 1);
    assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reactor_spreads_connections() {
    let port = reserve_tcp_port();
    let proto = format!("tcp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let handler = Arc::new(Echo::new(ready_tx));

    let options = Options {
        num_event_loop: 3,
        lb: LoadBalancing::RoundRobin,
        ..Default::default()
    };
    let serve_handler = Arc::clone(&handler);
    let serve_proto = proto.clone();
    let jh = thread::spawn(move || serve_arc(serve_handler, &serve_proto, options));

    let addr = ready_rx.recv_timeout(WAIT).unwrap();
    let mut streams = Vec::new();
    for i in 0..9u8 {
        let mut stream = connect(addr);
        let msg = [b'a' + i; 4];
        stream.write_all(&msg).unwrap();
        assert_eq!(read_exact(&mut stream, 4), msg);
        streams.push(stream);
    }
    assert_eq!(handler.opened.load(Ordering::SeqCst), 9);
    drop(streams);

    shutdown_when_registered(&proto);
    jh.join().unwrap().unwrap();

    assert_eq!(handler.closed.load(Ordering::SeqCst), 9);
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_init_complete_can_abort_startup() {
    let port = reserve_tcp_port();
    let proto = format!("tcp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let mut handler = Echo::new(ready_tx);
    handler.init_action = Action::Shutdown;
    let handler = Arc::new(handler);

    let serve_handler = Arc::clone(&handler);
    let res = serve_arc(serve_handler, &proto, Options::default());
    assert!(res.is_ok());

    // The view was delivered, but no loop ever ran and no shutdown fired.
    assert!(ready_rx.try_recv().is_ok());
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 0);
    assert_eq!(handler.opened.load(Ordering::SeqCst), 0);

    // Nothing was left in the registry either.
    assert!(matches!(shutdown(&proto), Err(Error::ServerNotFound(_))));
}

#[test]
fn test_shutdown_is_idempotent() {
    let port = reserve_tcp_port();
    let proto = format!("tcp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let handler = Arc::new(Echo::new(ready_tx));

    let serve_handler = Arc::clone(&handler);
    let serve_proto = proto.clone();
    let jh = thread::spawn(move || serve_arc(serve_handler, &serve_proto, Options::default()));

    let _ = ready_rx.recv_timeout(WAIT).unwrap();
    // Repeated signals collapse into one stop sequence; later calls may
    // race the registry removal, which is fine.
    shutdown_when_registered(&proto);
    let _ = shutdown(&proto);
    let _ = shutdown(&proto);
    jh.join().unwrap().unwrap();

    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
}

struct TickingEcho {
    inner: Echo,
    ticks: AtomicUsize,
}

impl EventHandler for TickingEcho {
    fn on_init_complete(&self, svr: &Server) -> Action {
        self.inner.on_init_complete(svr)
    }

    fn on_shutdown(&self, svr: &Server) {
        self.inner.on_shutdown(svr);
    }

    fn on_tick(&self) -> (Duration, Action) {
        let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= 3 {
            (Duration::from_millis(10), Action::Shutdown)
        } else {
            (Duration::from_millis(10), Action::None)
        }
    }
}

#[test]
fn test_ticker_can_stop_the_server() {
    let port = reserve_tcp_port();
    let proto = format!("tcp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let handler = Arc::new(TickingEcho {
        inner: Echo::new(ready_tx),
        ticks: AtomicUsize::new(0),
    });

    let options = Options {
        ticker: true,
        num_event_loop: 2,
        ..Default::default()
    };
    let serve_handler = Arc::clone(&handler);
    let jh = thread::spawn(move || serve_arc(serve_handler, &proto, options));

    let _ = ready_rx.recv_timeout(WAIT).unwrap();
    jh.join().unwrap().unwrap();

    assert!(handler.ticks.load(Ordering::SeqCst) >= 3);
    assert_eq!(handler.inner.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_udp_distributed_echo() {
    let port = reserve_udp_port();
    let proto = format!("udp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let handler = Arc::new(Echo::new(ready_tx));

    let options = Options {
        num_event_loop: 4,
        ..Default::default()
    };
    let serve_handler = Arc::clone(&handler);
    let serve_proto = proto.clone();
    let jh = thread::spawn(move || serve_arc(serve_handler, &serve_proto, options));

    let addr = ready_rx.recv_timeout(WAIT).unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.send_to(b"ping", addr).unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from, addr);

    shutdown_when_registered(&proto);
    jh.join().unwrap().unwrap();
    assert_eq!(handler.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_connector_rejects_bad_fd() {
    let conn_fd = ConnFd {
        fd: -1,
        remote_addr: "127.0.0.1:1".parse().unwrap(),
    };
    let res = add_tcp_connector("tcp://127.0.0.1:1", conn_fd, Some(0u32));
    assert!(matches!(res, Err(Error::TypeMismatch(_))));
}

#[test]
fn test_shutdown_unknown_server() {
    assert!(matches!(
        shutdown("tcp://127.0.0.1:1"),
        Err(Error::ServerNotFound(_))
    ));
}

#[test]
fn test_connector_attach_adopts_socket() {
    let port = reserve_tcp_port();
    let proto = format!("tcp://127.0.0.1:{port}");
    let (ready_tx, ready_rx) = bounded(1);
    let handler = Arc::new(Echo::new(ready_tx));

    let serve_handler = Arc::clone(&handler);
    let serve_proto = proto.clone();
    let jh = thread::spawn(move || serve_arc(serve_handler, &serve_proto, Options::default()));
    let _ = ready_rx.recv_timeout(WAIT).unwrap();

    // A plain listener stands in for the remote service the server dials.
    let remote = TcpListener::bind("127.0.0.1:0").unwrap();
    let remote_addr = remote.local_addr().unwrap();

    // The registry entry appears shortly after startup; retry the attach
    // with a fresh socket until the server is visible.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let conn_fd =
            ConnFd::connect(&format!("tcp://{remote_addr}"), &Options::default()).unwrap();
        match add_tcp_connector(&proto, conn_fd, Some(42u32)) {
            Ok(()) => break,
            Err(_) if std::time::Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("attach never succeeded: {e}"),
        }
    }

    // Only the adopted socket echoes; sockets left over from attempts that
    // lost the registration race never answer.
    let mut echoed = false;
    while std::time::Instant::now() < deadline {
        let (mut peer, _) = remote.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        peer.write_all(b"over here").unwrap();
        let mut buf = [0u8; 9];
        if peer.read_exact(&mut buf).is_ok() {
            assert_eq!(&buf, b"over here");
            echoed = true;
            break;
        }
    }
    assert!(echoed, "adopted connection never echoed");

    shutdown_when_registered(&proto);
    jh.join().unwrap().unwrap();
    assert!(handler.opened.load(Ordering::SeqCst) >= 1);
}
