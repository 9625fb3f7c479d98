//! Process-lifetime counters (spec 4.7 `GET /stats`): every field is a plain
//! `AtomicU64`, snapshotted into a serde-serializable struct on request.

use crate::pool::BindingTable;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time view of the counters plus the Binding Table's live gauges.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub handed_out: u64,
    pub tunnels_opened: u64,
    pub tunnels_failed_remote: u64,
    pub tunnels_failed_client: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub active_ready_ports: usize,
    pub known_bad_remotes: usize,
    pub total_remotes: usize,
}

/// Process-lifetime traffic and outcome counters.
#[derive(Debug, Default)]
pub struct Statistics {
    total_requests: AtomicU64,
    handed_out: AtomicU64,
    tunnels_opened: AtomicU64,
    tunnels_failed_remote: AtomicU64,
    tunnels_failed_client: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl Statistics {
    pub fn new() -> Self {
        Statistics::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handed_out(&self) {
        self.handed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_opened(&self) {
        self.tunnels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_failed_remote(&self) {
        self.tunnels_failed_remote.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_failed_client(&self) {
        self.tunnels_failed_client.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, n: u64) {
        self.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, n: u64) {
        self.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, table: &BindingTable) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            handed_out: self.handed_out.load(Ordering::Relaxed),
            tunnels_opened: self.tunnels_opened.load(Ordering::Relaxed),
            tunnels_failed_remote: self.tunnels_failed_remote.load(Ordering::Relaxed),
            tunnels_failed_client: self.tunnels_failed_client.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            active_ready_ports: table.active_ready_ports(),
            known_bad_remotes: table.known_bad_remotes(),
            total_remotes: table.total_remotes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RemoteRegistry;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_reflects_counters_and_table() {
        let registry = Arc::new(RemoteRegistry::from_str("r1.example 1080 a b\n").unwrap());
        let table = BindingTable::new(10000, 1, registry);
        table.rebind(10000);

        let stats = Statistics::new();
        stats.record_request();
        stats.record_handed_out();
        stats.add_bytes_up(100);
        stats.add_bytes_down(200);

        let snapshot = stats.snapshot(&table);
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.handed_out, 1);
        assert_eq!(snapshot.bytes_up, 100);
        assert_eq!(snapshot.bytes_down, 200);
        assert_eq!(snapshot.active_ready_ports, 1);
    }

}
