//! Mapping new connections onto event loops.
//!
//! A tagged variant rather than a trait object: the set of policies is
//! closed and the dispatch is one `match`. Registration happens only during
//! startup on the supervisor thread; `next` runs concurrently afterwards
//! (main reactor and connector attaches), so the per-variant state is either
//! atomic or read-only.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::LoadBalancing;
use crate::eventloop::LoopHandle;

pub(crate) enum LoadBalancer {
    RoundRobin {
        loops: Vec<Arc<LoopHandle>>,
        next: AtomicUsize,
    },
    LeastConnections {
        loops: Vec<Arc<LoopHandle>>,
    },
    SourceAddrHash {
        loops: Vec<Arc<LoopHandle>>,
        /// TCP hashes IP + port; UDP hashes the IP only.
        hash_port: bool,
    },
}

impl LoadBalancer {
    pub(crate) fn new(kind: LoadBalancing, hash_port: bool) -> LoadBalancer {
        match kind {
            LoadBalancing::RoundRobin => LoadBalancer::RoundRobin {
                loops: Vec::new(),
                next: AtomicUsize::new(0),
            },
            LoadBalancing::LeastConnections => LoadBalancer::LeastConnections {
                loops: Vec::new(),
            },
            LoadBalancing::SourceAddrHash => LoadBalancer::SourceAddrHash {
                loops: Vec::new(),
                hash_port,
            },
        }
    }

    /// Register a loop. Its index becomes the current pool size.
    pub(crate) fn register(&mut self, el: Arc<LoopHandle>) {
        let loops = self.loops_mut();
        el.set_idx(loops.len() as i32);
        loops.push(el);
    }

    /// Pick the loop for a connection from `remote`.
    ///
    /// The pool is never empty once the server has started; callers only
    /// reach this after registration completed.
    pub(crate) fn next(&self, remote: SocketAddr) -> Arc<LoopHandle> {
        match self {
            LoadBalancer::RoundRobin { loops, next } => {
                let idx = next.fetch_add(1, Ordering::Relaxed) % loops.len();
                Arc::clone(&loops[idx])
            }
            LoadBalancer::LeastConnections { loops } => {
                let el = loops
                    .iter()
                    .min_by_key(|el| (el.conn_count(), el.idx()))
                    .expect("load balancer has no registered loops");
                Arc::clone(el)
            }
            LoadBalancer::SourceAddrHash { loops, hash_port } => {
                let idx = (hash_addr(&remote, *hash_port) as usize) % loops.len();
                Arc::clone(&loops[idx])
            }
        }
    }

    /// Visit every registered loop until the callback returns `false`.
    pub(crate) fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(usize, &Arc<LoopHandle>) -> bool,
    {
        for (i, el) in self.loops().iter().enumerate() {
            if !f(i, el) {
                break;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.loops().len()
    }

    fn loops(&self) -> &Vec<Arc<LoopHandle>> {
        match self {
            LoadBalancer::RoundRobin { loops, .. }
            | LoadBalancer::LeastConnections { loops }
            | LoadBalancer::SourceAddrHash { loops, .. } => loops,
        }
    }

    fn loops_mut(&mut self) -> &mut Vec<Arc<LoopHandle>> {
        match self {
            LoadBalancer::RoundRobin { loops, .. }
            | LoadBalancer::LeastConnections { loops }
            | LoadBalancer::SourceAddrHash { loops, .. } => loops,
        }
    }
}

/// FNV-1a over the address bytes: stable for the process lifetime and
/// independent of formatting, which is all source hashing needs.
fn hash_addr(addr: &SocketAddr, hash_port: bool) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

    let mut hash = OFFSET;
    match addr.ip() {
        IpAddr::V4(ip) => hash = fnv1a(hash, &ip.octets()),
        IpAddr::V6(ip) => hash = fnv1a(hash, &ip.octets()),
    }
    if hash_port {
        hash = fnv1a(hash, &addr.port().to_be_bytes());
    }
    hash
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netpoll::Poller;

    fn pool(kind: LoadBalancing, n: usize) -> (Vec<Poller>, LoadBalancer) {
        let mut pollers = Vec::new();
        let mut lb = LoadBalancer::new(kind, true);
        for _ in 0..n {
            let poller = Poller::open().unwrap();
            lb.register(Arc::new(LoopHandle::new(poller.handle())));
            pollers.push(poller);
        }
        (pollers, lb)
    }

    #[test]
    fn test_registration_assigns_indices() {
        let (_pollers, lb) = pool(LoadBalancing::RoundRobin, 3);
        assert_eq!(lb.len(), 3);
        let mut seen = Vec::new();
        lb.iterate(|i, el| {
            assert_eq!(el.idx(), i as i32);
            seen.push(i);
            true
        });
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_round_robin_distribution() {
        let (_pollers, lb) = pool(LoadBalancing::RoundRobin, 3);
        let remote: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        let mut counts = vec![0; 3];
        for _ in 0..9 {
            let el = lb.next(remote);
            counts[el.idx() as usize] += 1;
        }
        assert_eq!(counts, vec![3, 3, 3]);
    }

    #[test]
    fn test_round_robin_full_cycle() {
        let (_pollers, lb) = pool(LoadBalancing::RoundRobin, 4);
        let remote: SocketAddr = "10.0.0.1:5000".parse().unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(lb.next(remote).idx());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_least_connections_ties_break_low() {
        let (_pollers, lb) = pool(LoadBalancing::LeastConnections, 3);
        let remote: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(lb.next(remote).idx(), 0);
    }

    #[test]
    fn test_source_hash_is_stable() {
        let (_pollers, lb) = pool(LoadBalancing::SourceAddrHash, 5);
        let a: SocketAddr = "192.168.1.7:40000".parse().unwrap();
        let b: SocketAddr = "192.168.1.8:40000".parse().unwrap();

        let first = lb.next(a).idx();
        for _ in 0..10 {
            assert_eq!(lb.next(a).idx(), first);
        }
        // A different peer is allowed to collide, but the hash itself must
        // distinguish the inputs.
        assert_ne!(hash_addr(&a, true), hash_addr(&b, true));
    }

    #[test]
    fn test_source_hash_port_sensitivity() {
        let a: SocketAddr = "192.168.1.7:40000".parse().unwrap();
        let b: SocketAddr = "192.168.1.7:40001".parse().unwrap();
        assert_ne!(hash_addr(&a, true), hash_addr(&b, true));
        assert_eq!(hash_addr(&a, false), hash_addr(&b, false));
    }
}
