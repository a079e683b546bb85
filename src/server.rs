//! Server bootstrap and supervision.
//!
//! `serve` blocks for the whole server lifetime: it binds the listener,
//! picks a topology, wires the load balancer, spawns one thread per event
//! loop (plus the main reactor and the ticker when configured), then parks
//! on the shutdown signal and runs the stop sequence.
//!
//! Topology rule: distributed accept iff `reuse_port` is set or the network
//! is UDP; otherwise main reactor + sub-reactors.

use std::any::Any;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, Passthrough};
use crate::config::Options;
use crate::connection::Conn;
use crate::errors::{Error, Result};
use crate::eventloop::{self, EventLoop, LoopHandle};
use crate::handler::{Action, EventHandler, Server};
use crate::listener::{init_listener, parse_proto_addr, tcp_connect, Listener};
use crate::loadbalancer::LoadBalancer;
use crate::netpoll::Poller;

const MAIN_REACTOR_IDX: i32 = -1;

/// All running servers, keyed by the proto address they were served on.
/// Written once per `serve`, read by [`shutdown`] and [`add_tcp_connector`].
static SERVERS: LazyLock<Mutex<HashMap<String, Arc<ServerCore>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// One-shot signaler the supervisor parks on. Signaling is idempotent.
struct ShutdownSignal {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    fn new() -> ShutdownSignal {
        ShutdownSignal {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !*signaled {
            *signaled = true;
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Shared server state. Event loops hold this as a back reference; it never
/// owns the loops themselves, so there is no cycle. The supervisor joins
/// the loop threads before the last `Arc` drops.
pub(crate) struct ServerCore {
    pub(crate) opts: Options,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) lb: LoadBalancer,
    pub(crate) main_loop: Option<Arc<LoopHandle>>,
    ln: Arc<Listener>,
    in_shutdown: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: ShutdownSignal,
}

impl ServerCore {
    /// Request shutdown. Idempotent; callable from any thread, including
    /// from inside handler callbacks.
    pub(crate) fn signal_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.signal();
    }

    /// Whether shutdown has been requested (stop sequence may still be
    /// running).
    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether the stop sequence has completed.
    fn is_in_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }
}

struct PendingLoop {
    poller: Poller,
    handle: Arc<LoopHandle>,
    ln: Option<Arc<Listener>>,
}

/// Serve `proto_addr` (e.g. `"tcp://127.0.0.1:9000"`, `"udp://0.0.0.0:53"`)
/// with the given handler, blocking until the server shuts down.
///
/// Returns an error when the listener cannot be bound or a poller cannot be
/// opened; after a successful start it returns `Ok(())` once the stop
/// sequence completes.
pub fn serve<H: EventHandler>(handler: H, proto_addr: &str, options: Options) -> Result<()> {
    serve_arc(Arc::new(handler), proto_addr, options)
}

/// [`serve`] for a handler that is already shared.
pub fn serve_arc(
    handler: Arc<dyn EventHandler>,
    proto_addr: &str,
    options: Options,
) -> Result<()> {
    let (network, addr) = parse_proto_addr(proto_addr)?;
    let ln = Arc::new(init_listener(network, &addr, &options)?);
    let num_event_loop = options.num_event_loops();
    let codec: Arc<dyn Codec> = options
        .codec
        .clone()
        .unwrap_or_else(|| Arc::new(Passthrough));

    let view = Server {
        addr: ln.lnaddr(),
        multicore: options.multicore,
        num_event_loop,
        reuse_port: options.reuse_port,
        tcp_keepalive: options.tcp_keepalive,
    };

    info!(
        network = %network,
        addr = %view.addr,
        loops = num_event_loop,
        reuse_port = options.reuse_port,
        "server starting"
    );

    if handler.on_init_complete(&view) == Action::Shutdown {
        info!(addr = %view.addr, "startup aborted by handler");
        return Ok(());
    }

    let distributed = options.reuse_port || network.is_udp();
    let mut lb = LoadBalancer::new(options.lb, !network.is_udp());
    let mut pending: Vec<PendingLoop> = Vec::with_capacity(num_event_loop);
    let mut main_pending: Option<PendingLoop> = None;

    if distributed {
        for i in 0..num_event_loop {
            let loop_ln = if i > 0 && options.reuse_port {
                Arc::new(init_listener(ln.network(), ln.addr(), &options)?)
            } else {
                Arc::clone(&ln)
            };
            let poller = Poller::open()?;
            let handle = Arc::new(LoopHandle::new(poller.handle()));
            lb.register(Arc::clone(&handle));
            // A shared socket (UDP without reuse-port) is read by one loop
            // only; the others never register it.
            if i == 0 || options.reuse_port {
                handle.poller().add_read(loop_ln.fd())?;
            }
            pending.push(PendingLoop {
                poller,
                handle,
                ln: Some(loop_ln),
            });
        }
    } else {
        for _ in 0..num_event_loop {
            let poller = Poller::open()?;
            let handle = Arc::new(LoopHandle::new(poller.handle()));
            lb.register(Arc::clone(&handle));
            pending.push(PendingLoop {
                poller,
                handle,
                ln: None,
            });
        }

        let poller = Poller::open()?;
        let handle = Arc::new(LoopHandle::new(poller.handle()));
        handle.set_idx(MAIN_REACTOR_IDX);
        handle.poller().add_read(ln.fd())?;
        main_pending = Some(PendingLoop {
            poller,
            handle,
            ln: Some(Arc::clone(&ln)),
        });
    }

    let svr = Arc::new(ServerCore {
        opts: options.clone(),
        codec,
        handler: Arc::clone(&handler),
        lb,
        main_loop: main_pending.as_ref().map(|p| Arc::clone(&p.handle)),
        ln: Arc::clone(&ln),
        in_shutdown: AtomicBool::new(false),
        shutting_down: AtomicBool::new(false),
        shutdown: ShutdownSignal::new(),
    });

    // One thread per loop; the main reactor last.
    let lock_os_thread = options.lock_os_thread;
    let mut join_handles = Vec::with_capacity(num_event_loop + 1);
    let mut spawn_err: Option<Error> = None;

    for p in pending {
        let el = EventLoop::new(Arc::clone(&p.handle), p.ln.clone(), Arc::clone(&svr));
        let name = format!("loop-{}", p.handle.idx());
        let poller = p.poller;
        match thread::Builder::new()
            .name(name)
            .spawn(move || eventloop::run(poller, el, lock_os_thread))
        {
            Ok(jh) => join_handles.push(jh),
            Err(e) => {
                spawn_err = Some(e.into());
                break;
            }
        }
    }
    if spawn_err.is_none() {
        if let Some(p) = main_pending.take() {
            let el = EventLoop::new(Arc::clone(&p.handle), p.ln.clone(), Arc::clone(&svr));
            let poller = p.poller;
            match thread::Builder::new()
                .name("main-reactor".to_string())
                .spawn(move || eventloop::run(poller, el, lock_os_thread))
            {
                Ok(jh) => join_handles.push(jh),
                Err(e) => spawn_err = Some(e.into()),
            }
        }
    }
    if let Some(e) = spawn_err {
        // Unwind whatever already started: sentinel every loop, then join.
        notify_loops_shutdown(&svr);
        for jh in join_handles {
            let _ = jh.join();
        }
        error!(error = %e, "server failed to start");
        return Err(e);
    }

    // The ticker runs outside every poll loop, exactly one per server.
    let mut ticker_cancel: Option<Sender<()>> = None;
    let mut ticker_handle = None;
    if options.ticker {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let ticker_handler = Arc::clone(&handler);
        let ticker_svr = Arc::clone(&svr);
        match thread::Builder::new()
            .name("ticker".to_string())
            .spawn(move || run_ticker(ticker_handler, rx, ticker_svr))
        {
            Ok(jh) => {
                ticker_cancel = Some(tx);
                ticker_handle = Some(jh);
            }
            Err(e) => warn!(error = %e, "failed to start ticker"),
        }
    }

    registry().insert(proto_addr.to_string(), Arc::clone(&svr));

    // Park until something calls signal_shutdown, then stop.
    svr.shutdown.wait();
    debug!(addr = %view.addr, "shutdown signaled");

    handler.on_shutdown(&view);

    notify_loops_shutdown(&svr);

    for jh in join_handles {
        let _ = jh.join();
    }

    // Dropping the cancel sender wakes the ticker out of its sleep.
    drop(ticker_cancel);
    if let Some(jh) = ticker_handle {
        let _ = jh.join();
    }

    svr.in_shutdown.store(true, Ordering::SeqCst);
    registry().remove(proto_addr);
    info!(addr = %view.addr, "server stopped");
    Ok(())
}

/// Post the shutdown sentinel to every loop, main reactor included.
fn notify_loops_shutdown(svr: &ServerCore) {
    svr.lb.iterate(|_, h| {
        if let Err(e) = h.poller().trigger(|_| Err(Error::ServerShutdown)) {
            debug!(idx = h.idx(), error = %e, "loop already stopped");
        }
        true
    });
    if let Some(main) = &svr.main_loop {
        if let Err(e) = main.poller().trigger(|_| Err(Error::ServerShutdown)) {
            debug!(error = %e, "main reactor already stopped");
        }
    }
}

fn run_ticker(handler: Arc<dyn EventHandler>, cancel: Receiver<()>, svr: Arc<ServerCore>) {
    loop {
        let (mut delay, action) = handler.on_tick();
        if action == Action::Shutdown {
            svr.signal_shutdown();
        }
        if delay.is_zero() {
            delay = Duration::from_secs(1);
        }
        match cancel.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => {
                debug!("ticker cancelled");
                return;
            }
        }
    }
}

fn registry() -> std::sync::MutexGuard<'static, HashMap<String, Arc<ServerCore>>> {
    SERVERS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn registry_get(proto_addr: &str) -> Result<Arc<ServerCore>> {
    registry()
        .get(proto_addr)
        .cloned()
        .ok_or_else(|| Error::ServerNotFound(proto_addr.to_string()))
}

/// Shut down the server bound to `proto_addr`. Idempotent once the server
/// exists; `serve` returns shortly after.
pub fn shutdown(proto_addr: &str) -> Result<()> {
    let svr = registry_get(proto_addr)?;
    if !svr.is_in_shutdown() {
        svr.signal_shutdown();
    }
    Ok(())
}

/// A pre-connected TCP socket to hand to a running server.
///
/// `fd` must be an open, connected stream socket; ownership transfers to the
/// framework on a successful [`add_tcp_connector`] call, and the fd is
/// closed on every failure path past validation.
#[derive(Debug)]
pub struct ConnFd {
    /// Raw descriptor of the connected socket.
    pub fd: RawFd,
    /// Peer address of the socket.
    pub remote_addr: SocketAddr,
}

impl ConnFd {
    /// Open a TCP connection to `proto_addr` with the socket options from
    /// `options` applied, ready to attach to a server.
    pub fn connect(proto_addr: &str, options: &Options) -> Result<ConnFd> {
        let (network, addr) = parse_proto_addr(proto_addr)?;
        if network.is_udp() {
            return Err(Error::UnsupportedProtocol(network.to_string()));
        }
        let (stream, remote_addr) = tcp_connect(network, &addr, options)?;
        Ok(ConnFd {
            fd: stream.into_raw_fd(),
            remote_addr,
        })
    }
}

/// Attach a pre-connected TCP socket to the server bound to `proto_addr`.
///
/// The target loop is chosen by the server's load balancer; registration and
/// the open callback run on that loop via its trigger queue. `ctx` becomes
/// the connection's opaque context.
pub fn add_tcp_connector<T: Any + Send>(
    proto_addr: &str,
    conn_fd: ConnFd,
    ctx: Option<T>,
) -> Result<()> {
    if conn_fd.fd < 0 {
        return Err(Error::TypeMismatch(format!(
            "fd {} is not an open descriptor",
            conn_fd.fd
        )));
    }

    let svr = registry_get(proto_addr)?;
    if svr.ln.network().is_udp() {
        return Err(Error::TypeMismatch(
            "cannot attach a stream socket to a datagram server".to_string(),
        ));
    }
    if svr.shutdown_requested() {
        return Err(Error::ServerShutdown);
    }

    let target = svr.lb.next(conn_fd.remote_addr);
    // SAFETY: validated non-negative above; the caller hands over ownership
    // of the descriptor, and the stream closes it on every failure path.
    let stream = unsafe { TcpStream::from_raw_fd(conn_fd.fd) };
    stream.set_nonblocking(true)?;

    let mut conn = Conn::new_tcp(stream, conn_fd.remote_addr, target.poller().clone());
    if let Some(ctx) = ctx {
        conn.set_context(ctx);
    }

    target.poller().trigger(move |el| {
        if let Err(e) = el.register_conn(conn) {
            warn!(error = %e, "failed to attach connector");
        }
        Ok(())
    })
}
