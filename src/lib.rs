//! A local proxy-pool front-end: a fixed range of local ports, each speaking
//! both HTTP(S) CONNECT and SOCKS5, tunneling through an authenticated remote
//! proxy drawn from a large pool and rebound after every use.
//!
//! # Architecture
//!
//! ```text
//!                     +----------------+
//!                     |   hub/ (API)   |
//!                     +-------+--------+
//!                             |
//!        +--------------------+--------------------+
//!        |                    |                    |
//! +------v------+     +-------v-------+    +------v------+
//! |   config/   |     |   statistic/  |    |    pool/    |
//! +-------------+     +---------------+    +------+------+
//!                                                  |
//!        +-----------------------------------------+
//!        |                    |                    |
//! +------v------+     +-------v-------+    +------v------+
//! |  registry/  |     |   listener/   |    |   tunnel/   |
//! +-------------+     +---------------+    +-------------+
//! ```

pub mod common;
pub mod config;
pub mod hub;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod statistic;
pub mod tunnel;

pub use common::error::{PoolError, Result};
pub use config::Config;

use pool::{BindingTable, RotationOrchestrator};
use registry::RemoteRegistry;
use statistic::Statistics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period given to in-flight tunnels to drain after shutdown is requested
/// (spec 5: "2s grace to drain, then sockets are force-closed").
const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Owns every long-lived component: the binding table, the per-port listeners,
/// the rotation orchestrator, and the control-surface server.
pub struct ProxyPool {
    config: Config,
    table: Arc<BindingTable>,
    orchestrator: Arc<RotationOrchestrator>,
    stats: Arc<Statistics>,
    shutdown: CancellationToken,
}

impl ProxyPool {
    pub fn new(config: Config, registry: RemoteRegistry) -> Self {
        let table = Arc::new(BindingTable::new(
            config.port_base,
            config.port_count,
            Arc::new(registry),
        ));
        let shutdown = CancellationToken::new();
        let orchestrator = Arc::new(RotationOrchestrator::new(table.clone(), shutdown.clone()));
        let stats = Arc::new(Statistics::new());

        ProxyPool {
            config,
            table,
            orchestrator,
            stats,
            shutdown,
        }
    }

    /// Warm up the binding table, start one accept loop per port plus the
    /// control surface, and run until `Ctrl-C` or `shutdown()` is requested.
    pub async fn run(&self) -> Result<()> {
        info!(
            port_base = self.config.port_base,
            port_count = self.config.port_count,
            "starting proxy pool"
        );
        self.orchestrator.warmup(self.config.max_active_proxies);

        // Bind every port synchronously before spawning any accept loop: a bind
        // failure here must fail startup, not vanish inside a spawned task.
        let mut bound = Vec::new();
        for port in self.table.ports() {
            let tcp_listener = listener::bind_port(port).await?;
            bound.push((port, tcp_listener));
        }

        let mut listener_handles = Vec::new();
        for (port, tcp_listener) in bound {
            let table = self.table.clone();
            let orchestrator = self.orchestrator.clone();
            let stats = self.stats.clone();
            let shutdown = self.shutdown.clone();
            listener_handles.push(tokio::spawn(async move {
                if let Err(e) =
                    listener::serve(port, tcp_listener, table, orchestrator, stats, shutdown).await
                {
                    warn!(port, error = %e, "listener exited with an error");
                }
            }));
        }

        let control_addr: SocketAddr = format!("{}:{}", self.config.host, self.config.web_port)
            .parse()
            .map_err(|e| PoolError::config_fatal(format!("invalid control address: {}", e)))?;
        let app_state = hub::AppState {
            table: self.table.clone(),
            stats: self.stats.clone(),
        };
        let control_shutdown = self.shutdown.clone();
        let control_handle = tokio::spawn(async move {
            tokio::select! {
                result = hub::start_server(app_state, control_addr) => {
                    if let Err(e) = result {
                        warn!(error = %e, "control surface exited with an error");
                    }
                }
                _ = control_shutdown.cancelled() => {}
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        self.shutdown.cancel();

        let _ = tokio::time::timeout(SHUTDOWN_DRAIN_GRACE, async {
            for handle in listener_handles {
                let _ = handle.await;
            }
        })
        .await;
        control_handle.abort();

        info!("proxy pool stopped");
        Ok(())
    }

    /// Request a cooperative shutdown without waiting for `Ctrl-C` (used by tests).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn table(&self) -> &Arc<BindingTable> {
        &self.table
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }
}
