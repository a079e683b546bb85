//! mio-backed poller with a wakeup-driven task queue.
//!
//! Readiness notifications are edge-triggered: every consumer of this module
//! drains reads, writes, and accepts until `WouldBlock`. Sources are
//! registered by raw fd via `SourceFd`, with the fd doubling as the token, so
//! dispatch can key its connection map directly on kernel fds.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::trace;

use crate::errors::{Error, Result};
use crate::eventloop::EventLoop;

/// Token reserved for the wakeup channel; fds can never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAP: usize = 1024;

/// Work submitted to a loop from another thread. Runs exactly once on the
/// owning loop's thread; returning [`Error::ServerShutdown`] makes that loop
/// exit its run loop.
pub(crate) type Task = Box<dyn FnOnce(&mut EventLoop) -> Result<()> + Send>;

/// The loop-thread side: owns the `mio::Poll` and the task queue receiver.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    tasks: Receiver<Task>,
    handle: PollerHandle,
}

/// The shareable side of a poller. Cheap to clone; safe from any thread.
#[derive(Clone)]
pub(crate) struct PollerHandle {
    registry: Arc<Registry>,
    waker: Arc<Waker>,
    tasks: Sender<Task>,
}

impl Poller {
    /// Open a poller with its wakeup primitive.
    pub(crate) fn open() -> Result<Poller> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let registry = Arc::new(poll.registry().try_clone()?);
        let (tx, rx) = crossbeam_channel::unbounded();

        Ok(Poller {
            poll,
            events: Events::with_capacity(EVENTS_CAP),
            tasks: rx,
            handle: PollerHandle {
                registry,
                waker,
                tasks: tx,
            },
        })
    }

    pub(crate) fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    /// Drive the loop until a task or event handler returns an error.
    ///
    /// Each iteration waits for readiness, runs queued cross-thread tasks
    /// first, then dispatches every readiness event to the loop. `EINTR`
    /// retries the wait; [`Error::ServerShutdown`] propagates to the caller
    /// as the clean-exit signal.
    pub(crate) fn polling(&mut self, el: &mut EventLoop) -> Result<()> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for task in self.tasks.try_iter() {
                task(el)?;
            }

            for event in self.events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    trace!("poller woken");
                    continue;
                }
                el.handle_event(token.0 as RawFd, event)?;
            }
        }
    }
}

impl PollerHandle {
    /// Register `fd` for read readiness, keyed by its own value.
    pub(crate) fn add_read(&self, fd: RawFd) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    /// Widen `fd`'s interest to read + write (pending outbound data).
    pub(crate) fn mod_write(&self, fd: RawFd) -> io::Result<()> {
        self.registry.reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// Narrow `fd`'s interest back to read-only (outbound drained).
    pub(crate) fn mod_read(&self, fd: RawFd) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    /// Remove `fd` from the poller.
    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Queue `task` for the owning loop and wake it.
    ///
    /// Tasks from one submitter run in submission order. Fails with the
    /// shutdown sentinel when the owning loop has already exited and its
    /// queue is gone.
    pub(crate) fn trigger<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) -> Result<()> + Send + 'static,
    {
        self.tasks
            .send(Box::new(task))
            .map_err(|_| Error::ServerShutdown)?;
        self.waker.wake()?;
        Ok(())
    }
}
