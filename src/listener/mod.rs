//! Dual-Protocol Listener (C5): one accept loop per local port, sniffing the
//! first bytes to dispatch to the HTTP-CONNECT handler or the SOCKS5 handler,
//! grounded on `inbound::mixed`'s `process_connection` peek-and-branch.

pub mod http;
pub mod socks5;

use crate::pool::{BindingTable, Outcome, RotationOrchestrator};
use crate::statistic::Statistics;
use crate::{PoolError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PEEK_DEADLINE: Duration = Duration::from_secs(5);
const SOCKS4_VERSION: u8 = 0x04;

enum Protocol {
    Socks5,
    Http,
}

/// Bind the listening socket for `port`. Split from `serve` so the caller can
/// bind every port synchronously up front and fail startup fatally (spec 4.2:
/// "If any port cannot bind, the system fails to start") before any accept
/// loop is spawned.
pub async fn bind_port(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| PoolError::config_fatal(format!("bind 127.0.0.1:{}: {}", port, e)))
}

/// Runs the accept loop for an already-bound port until `shutdown` is cancelled.
pub async fn serve(
    port: u16,
    listener: TcpListener,
    table: Arc<BindingTable>,
    orchestrator: Arc<RotationOrchestrator>,
    stats: Arc<Statistics>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(port, error = %e, "accept failed");
                        continue;
                    }
                };
                let table = table.clone();
                let orchestrator = orchestrator.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    handle_connection(port, stream, peer, table, orchestrator, stats).await;
                });
            }
        }
    }
}

async fn handle_connection(
    port: u16,
    mut stream: TcpStream,
    peer: SocketAddr,
    table: Arc<BindingTable>,
    orchestrator: Arc<RotationOrchestrator>,
    stats: Arc<Statistics>,
) {
    let generation = match table.accept_port(port) {
        Some(generation) => generation,
        None => {
            debug!(port, %peer, "connection to a not-Ready port, closing");
            return;
        }
    };
    let remote_id = match table.remote_for(port, generation) {
        Some(id) => id,
        None => return,
    };
    let remote = match table.registry().get(remote_id) {
        Some(remote) => remote.clone(),
        None => return,
    };

    crate::common::net::configure_tcp_stream(&stream);

    let outcome = match sniff(&mut stream).await {
        Ok(Protocol::Socks5) => socks5::handle(&mut stream, &remote, &stats).await,
        Ok(Protocol::Http) => http::handle(&mut stream, &remote, &stats).await,
        Err(e) => {
            debug!(port, %peer, error = %e, "protocol sniff failed, closing");
            Outcome::ClientFailed
        }
    };

    if table.complete(port, generation, outcome) {
        match outcome {
            Outcome::RemoteFailed => stats.record_tunnel_failed_remote(),
            Outcome::ClientFailed => stats.record_tunnel_failed_client(),
            Outcome::ClientDone => stats.record_tunnel_opened(),
        }
        orchestrator.schedule_rebind(port);
    }
}

async fn sniff(stream: &mut TcpStream) -> Result<Protocol> {
    let mut buf = [0u8; 3];
    let n = timeout(PEEK_DEADLINE, stream.peek(&mut buf))
        .await
        .map_err(|_| PoolError::client_protocol("no bytes within sniff deadline"))??;
    if n == 0 {
        return Err(PoolError::client_protocol("connection closed before any bytes"));
    }
    match buf[0] {
        crate::common::socks::SOCKS5_VERSION => Ok(Protocol::Socks5),
        SOCKS4_VERSION => Err(PoolError::client_protocol("SOCKS4 unsupported")),
        b if is_http_method_byte(b) => Ok(Protocol::Http),
        _ => Err(PoolError::client_protocol("unrecognized protocol")),
    }
}

fn is_http_method_byte(b: u8) -> bool {
    matches!(b, b'C' | b'G' | b'P' | b'D' | b'H' | b'O')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_http_method_byte() {
        assert!(is_http_method_byte(b'C')); // CONNECT
        assert!(is_http_method_byte(b'G')); // GET
        assert!(!is_http_method_byte(0x05));
        assert!(!is_http_method_byte(0x04));
    }
}
