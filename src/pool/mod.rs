//! Binding Table & LRU Scheduler (C3+C4): maps local ports to remote proxies and
//! enforces the "one port, one remote, one use" discipline.

mod orchestrator;

pub use orchestrator::RotationOrchestrator;

use crate::registry::RemoteRegistry;
use crate::{PoolError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Lifecycle state of a single port's current Binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// Listener socket open, a remote selected, remote reachability not required.
    Preparing,
    /// Idled after creation or rotation; eligible to be handed out exactly once.
    Ready,
    /// Accepted a client connection on the current generation.
    InUse,
    /// Tunnel finished; generation about to advance.
    Draining,
}

/// A (port, remote, generation) triple — one use-cycle of a local port.
#[derive(Debug, Clone)]
struct Binding {
    remote_id: Option<usize>,
    state: BindingState,
    generation: u64,
}

/// Outcome reported to `complete` when a tunnel finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Client closed normally after a full tunnel; the remote is presumed good.
    ClientDone,
    /// The remote-side handshake failed; the remote is marked known-bad.
    RemoteFailed,
    /// The client socket errored before the remote closed; the remote is presumed good.
    ClientFailed,
}

struct PoolInner {
    bindings: Vec<Binding>,
    /// Remote indices eligible for the next `rebind`, least-recently-used at the front.
    lru: VecDeque<usize>,
    /// Bit-vector of remotes that failed a remote-side handshake; skipped for the
    /// rest of the process lifetime.
    known_bad: Vec<bool>,
    /// Port offsets (relative to `port_base`) whose Binding is currently Ready.
    ready_queue: VecDeque<usize>,
}

/// The global `LocalPort -> Binding` map plus the LRU queue of remote indices.
/// All mutation is serialized through a single mutex; no socket I/O happens
/// while it is held.
pub struct BindingTable {
    port_base: u16,
    port_count: u16,
    registry: Arc<RemoteRegistry>,
    inner: Mutex<PoolInner>,
}

impl BindingTable {
    pub fn new(port_base: u16, port_count: u16, registry: Arc<RemoteRegistry>) -> Self {
        let bindings = (0..port_count)
            .map(|_| Binding {
                remote_id: None,
                state: BindingState::Draining,
                generation: 0,
            })
            .collect();
        let lru = (0..registry.count()).collect();
        let known_bad = vec![false; registry.count()];

        BindingTable {
            port_base,
            port_count,
            registry,
            inner: Mutex::new(PoolInner {
                bindings,
                lru,
                known_bad,
                ready_queue: VecDeque::new(),
            }),
        }
    }

    pub fn port_base(&self) -> u16 {
        self.port_base
    }

    pub fn port_count(&self) -> u16 {
        self.port_count
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        let base = self.port_base;
        (0..self.port_count).map(move |offset| base + offset)
    }

    fn offset_of(&self, port: u16) -> Option<usize> {
        if port < self.port_base || port >= self.port_base + self.port_count {
            return None;
        }
        Some((port - self.port_base) as usize)
    }

    /// `reserve_ready_port() -> (port, generation)`: pop any port whose Binding is
    /// Ready, flip it to InUse on the same generation. `NoReady` if none is Ready.
    pub fn reserve_ready_port(&self) -> Result<(u16, u64)> {
        let mut inner = self.inner.lock();
        while let Some(offset) = inner.ready_queue.pop_front() {
            let binding = &mut inner.bindings[offset];
            if binding.state != BindingState::Ready {
                // Stale queue entry (shouldn't happen, but never trust it blindly).
                continue;
            }
            binding.state = BindingState::InUse;
            let generation = binding.generation;
            return Ok((self.port_base + offset as u16, generation));
        }
        Err(PoolError::NoReady)
    }

    /// Listener-side counterpart of `reserve_ready_port` for direct connections: a
    /// client that connects without a prior `acquire()`. If the port's Binding is
    /// already InUse (the normal case — `acquire` claimed it), returns that
    /// generation. If it's still Ready, claims it now. Otherwise, not acceptable.
    pub fn accept_port(&self, port: u16) -> Option<u64> {
        let offset = self.offset_of(port)?;
        let mut inner = self.inner.lock();
        let generation = inner.bindings[offset].generation;
        match inner.bindings[offset].state {
            BindingState::InUse => Some(generation),
            BindingState::Ready => {
                inner.bindings[offset].state = BindingState::InUse;
                if let Some(pos) = inner.ready_queue.iter().position(|&o| o == offset) {
                    inner.ready_queue.remove(pos);
                }
                Some(generation)
            }
            BindingState::Preparing | BindingState::Draining => None,
        }
    }

    /// The remote currently bound to `port`, regardless of state. Used by the
    /// listener/tunnel engine once a (port, generation) has been claimed.
    pub fn remote_for(&self, port: u16, generation: u64) -> Option<usize> {
        let offset = self.offset_of(port)?;
        let inner = self.inner.lock();
        let binding = &inner.bindings[offset];
        if binding.generation != generation {
            return None;
        }
        binding.remote_id
    }

    /// `complete(port, generation, outcome)`: InUse (or Preparing, on RemoteFailed)
    /// -> Draining. No-op if `generation` is stale. Returns `true` if a rebind
    /// should now be scheduled (i.e. the call was not a no-op).
    pub fn complete(&self, port: u16, generation: u64, outcome: Outcome) -> bool {
        let Some(offset) = self.offset_of(port) else {
            return false;
        };
        let mut inner = self.inner.lock();
        let binding = &mut inner.bindings[offset];
        if binding.generation != generation {
            return false;
        }
        if binding.state != BindingState::InUse && binding.state != BindingState::Preparing {
            return false;
        }
        let remote_id = binding.remote_id;
        binding.state = BindingState::Draining;

        if let Some(remote_id) = remote_id {
            match outcome {
                Outcome::ClientDone | Outcome::ClientFailed => inner.lru.push_back(remote_id),
                Outcome::RemoteFailed => inner.known_bad[remote_id] = true,
            }
        }
        true
    }

    /// `rebind(port)`: pop the least-recently-used non-bad remote, install a new
    /// Binding at Ready, bump generation. Returns `false` (port stays Draining) if
    /// no remote is currently available.
    pub fn rebind(&self, port: u16) -> bool {
        let Some(offset) = self.offset_of(port) else {
            return false;
        };
        let mut inner = self.inner.lock();
        loop {
            let Some(remote_id) = inner.lru.pop_front() else {
                return false;
            };
            if inner.known_bad[remote_id] {
                continue;
            }
            let binding = &mut inner.bindings[offset];
            binding.remote_id = Some(remote_id);
            binding.generation += 1;
            binding.state = BindingState::Ready;
            inner.ready_queue.push_back(offset);
            return true;
        }
    }

    pub fn active_ready_ports(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .bindings
            .iter()
            .filter(|b| b.state == BindingState::Ready)
            .count()
    }

    pub fn known_bad_remotes(&self) -> usize {
        let inner = self.inner.lock();
        inner.known_bad.iter().filter(|&&bad| bad).count()
    }

    pub fn total_remotes(&self) -> usize {
        self.registry.count()
    }

    pub fn registry(&self) -> &RemoteRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RemoteRegistry;

    fn registry(n: usize) -> Arc<RemoteRegistry> {
        let body: String = (0..n)
            .map(|i| format!("r{}.example {} user pass\n", i, 1080 + i))
            .collect();
        Arc::new(RemoteRegistry::from_str(&body).unwrap())
    }

    #[test]
    fn test_reserve_requires_ready() {
        let table = BindingTable::new(10000, 2, registry(2));
        assert!(matches!(table.reserve_ready_port(), Err(PoolError::NoReady)));
        assert!(table.rebind(10000));
        let (port, generation) = table.reserve_ready_port().unwrap();
        assert_eq!(port, 10000);
        assert_eq!(generation, 1);
    }

    #[test]
    fn test_one_shot_invariant() {
        let table = BindingTable::new(10000, 1, registry(2));
        assert!(table.rebind(10000));
        let (port, generation) = table.reserve_ready_port().unwrap();
        assert_eq!(port, 10000);
        // A second reserve must not return the same port/generation again.
        assert!(matches!(table.reserve_ready_port(), Err(PoolError::NoReady)));
        assert_eq!(table.remote_for(port, generation), Some(0));
    }

    #[test]
    fn test_complete_client_done_reenqueues_remote() {
        let table = BindingTable::new(10000, 1, registry(2));
        table.rebind(10000);
        let (port, generation) = table.reserve_ready_port().unwrap();
        let remote = table.remote_for(port, generation).unwrap();
        assert!(table.complete(port, generation, Outcome::ClientDone));
        assert!(table.rebind(port));
        let (_, generation2) = table.reserve_ready_port().unwrap();
        let remote2 = table.remote_for(port, generation2).unwrap();
        assert_ne!(remote, remote2);
    }

    #[test]
    fn test_remote_failed_marks_known_bad_and_never_reused() {
        let table = BindingTable::new(10000, 1, registry(2));
        table.rebind(10000);
        let (port, generation) = table.reserve_ready_port().unwrap();
        let bad_remote = table.remote_for(port, generation).unwrap();
        assert!(table.complete(port, generation, Outcome::RemoteFailed));
        assert_eq!(table.known_bad_remotes(), 1);
        assert!(table.rebind(port));
        let (_, generation2) = table.reserve_ready_port().unwrap();
        assert_ne!(table.remote_for(port, generation2), Some(bad_remote));

        // Exhaust the other remote too and drain it back; the bad one must never resurface.
        table.complete(port, generation2, Outcome::ClientDone);
        assert!(table.rebind(port));
        let (_, generation3) = table.reserve_ready_port().unwrap();
        assert_ne!(table.remote_for(port, generation3), Some(bad_remote));
    }

    #[test]
    fn test_stale_generation_complete_is_noop() {
        let table = BindingTable::new(10000, 1, registry(1));
        table.rebind(10000);
        let (port, generation) = table.reserve_ready_port().unwrap();
        assert!(!table.complete(port, generation + 1, Outcome::ClientDone));
    }

    #[test]
    fn test_accept_port_claims_direct_connection() {
        let table = BindingTable::new(10000, 1, registry(1));
        table.rebind(10000);
        // No prior reserve_ready_port call: the listener claims it directly.
        let generation = table.accept_port(10000).unwrap();
        assert_eq!(generation, 1);
        assert!(table.accept_port(10000).is_some()); // already InUse, idempotent read
        assert!(matches!(table.reserve_ready_port(), Err(PoolError::NoReady)));
    }

    #[test]
    fn test_rebind_with_all_remotes_bad_stays_draining() {
        let table = BindingTable::new(10000, 1, registry(1));
        table.rebind(10000);
        let (port, generation) = table.reserve_ready_port().unwrap();
        table.complete(port, generation, Outcome::RemoteFailed);
        assert!(!table.rebind(port));
    }
}
