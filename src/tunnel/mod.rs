//! Tunnel Engine (C6): dials and authenticates to the bound remote, then
//! bidirectionally splices client <-> remote until either side closes.

pub mod http_client;
pub mod socks5_client;

use crate::common::Address;
use crate::pool::Outcome;
use crate::registry::{RemoteKind, RemoteProxy};
use crate::statistic::Statistics;
use crate::{PoolError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

/// Combined dial+handshake deadline (spec 4.5).
const DIAL_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `remote` and perform its remote-side handshake to `target:target_port`,
/// dispatching on `remote.kind`. On any failure the binding must be treated as
/// `RemoteFailed` by the caller (the remote is marked known-bad).
pub async fn dial_and_handshake(
    remote: &RemoteProxy,
    target: &Address,
    target_port: u16,
) -> Result<TcpStream> {
    timeout(
        DIAL_HANDSHAKE_TIMEOUT,
        dial_and_handshake_inner(remote, target, target_port),
    )
    .await
    .map_err(|_| PoolError::remote_handshake_failed("dial+handshake exceeded 10s deadline"))?
}

async fn dial_and_handshake_inner(
    remote: &RemoteProxy,
    target: &Address,
    target_port: u16,
) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(remote.addr())
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("dial {}: {}", remote.addr(), e)))?;
    stream.set_nodelay(true).ok();

    match remote.kind {
        RemoteKind::Socks5 => {
            socks5_client::handshake(&mut stream, remote, target, target_port).await?
        }
        RemoteKind::Http => {
            http_client::handshake(&mut stream, remote, &target.to_host(), target_port).await?
        }
    }

    Ok(stream)
}

/// Splice an already-accepted client connection against an already-handshaken
/// remote stream, updating the crate-wide byte counters, and derive the
/// `Outcome` to report back through the Orchestrator to `complete()`.
///
/// `ClientDone` and `ClientFailed` have identical effects on the LRU queue (the
/// remote is presumed good and re-enqueued either way); this only affects which
/// counter is incremented and what gets logged.
pub async fn splice<C>(client: &mut C, remote: &mut TcpStream, stats: &Statistics) -> Outcome
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match crate::common::net::copy_bidirectional(client, remote).await {
        Ok((up, down)) => {
            stats.add_bytes_up(up);
            stats.add_bytes_down(down);
            Outcome::ClientDone
        }
        Err(e) => {
            // Mid-tunnel I/O failure: the remote is not marked bad (intermittent),
            // unlike a RemoteHandshakeFailed at dial time.
            let e = PoolError::remote_io_failed(e.to_string());
            warn!(error = %e, "tunnel ended with an I/O error mid-stream");
            Outcome::ClientFailed
        }
    }
}
