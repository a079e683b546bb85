//! Kernel readiness multiplexing.
//!
//! One [`Poller`] per event loop, owned by that loop's thread. Other threads
//! interact with a loop exclusively through its clonable [`PollerHandle`]:
//! interest changes keyed by raw fd, and `trigger`, which queues a task for
//! the owning thread and wakes its poll.

mod poller;

pub(crate) use poller::{Poller, PollerHandle};
