//! Rotation Orchestrator (C8): owns the background worker pool that performs
//! `rebind` work outside the binding-table lock, and the warmup pass at startup.

use super::BindingTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REBIND_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const REBIND_BACKOFF_CAP: Duration = Duration::from_secs(2);

pub struct RotationOrchestrator {
    table: Arc<BindingTable>,
    /// Bounds concurrent rebind dials to `min(32, N)` (spec 5: "a fixed-size worker
    /// pool"); rebind itself never dials a socket, but the bound still caps how many
    /// backoff-retry loops can run concurrently.
    workers: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl RotationOrchestrator {
    pub fn new(table: Arc<BindingTable>, shutdown: CancellationToken) -> Self {
        let worker_count = std::cmp::min(32, table.port_count() as usize).max(1);
        RotationOrchestrator {
            table,
            workers: Arc::new(Semaphore::new(worker_count)),
            shutdown,
        }
    }

    /// At startup, bind every port up to `min(port_count, max_active_proxies,
    /// registry.count())`. Ports beyond that bound stay Draining.
    pub fn warmup(&self, max_active_proxies: usize) {
        let limit = std::cmp::min(
            self.table.port_count() as usize,
            std::cmp::min(max_active_proxies, self.table.total_remotes()),
        );
        let mut bound = 0;
        for port in self.table.ports().take(limit) {
            if self.table.rebind(port) {
                bound += 1;
            }
        }
        info!(
            bound,
            requested = limit,
            total_ports = self.table.port_count(),
            "warmup complete"
        );
    }

    /// Schedule a rebind of `port` on the background worker pool. Retries with
    /// exponential backoff (100ms -> 2s cap) while the LRU queue is empty.
    pub fn schedule_rebind(&self, port: u16) {
        let table = self.table.clone();
        let workers = self.workers.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire().await else {
                return;
            };
            let mut backoff = REBIND_BACKOFF_INITIAL;
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                if table.rebind(port) {
                    debug!(port, "rebind succeeded");
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff = std::cmp::min(backoff * 2, REBIND_BACKOFF_CAP);
                warn!(port, ?backoff, "rebind found no available remote, retrying");
            }
        });
    }
}
