//! Network utilities

use crate::{PoolError, Result};
use socket2::SockRef;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Splice buffer size (spec 4.5: "two half-duplex copy loops with 32 KiB buffers").
const SPLICE_BUF_SIZE: usize = 32 * 1024;

/// Idle timeout before a tunnel with no traffic in either direction is aborted.
const SPLICE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_reuse_address(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// SOCKS5 address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name
    Domain(String),
}

impl Address {
    /// Get as domain string
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => d.clone(),
        }
    }
}

/// Splice two streams bidirectionally with fixed-size buffers and a shared idle timeout.
///
/// Each direction runs as its own half-duplex copy loop; on EOF the writer half of the
/// opposite side is shut down (TCP half-close). Bytes crossing in *either* direction reset
/// a shared idle clock; if neither direction moves a byte for `SPLICE_IDLE_TIMEOUT`, both
/// loops are aborted.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let activity = parking_lot::Mutex::new(tokio::time::Instant::now());

    let up = pump(&mut ar, &mut bw, &activity);
    let down = pump(&mut br, &mut aw, &activity);
    let watchdog = idle_watchdog(&activity);

    tokio::select! {
        result = async { tokio::join!(up, down) } => {
            let (up, down) = result;
            Ok((up?, down?))
        }
        _ = watchdog => Err(PoolError::timeout("tunnel idle for 60s")),
    }
}

/// Fires once the shared activity clock has been stale for `SPLICE_IDLE_TIMEOUT`.
async fn idle_watchdog(activity: &parking_lot::Mutex<tokio::time::Instant>) {
    loop {
        let last = *activity.lock();
        let elapsed = last.elapsed();
        if elapsed >= SPLICE_IDLE_TIMEOUT {
            return;
        }
        tokio::time::sleep(SPLICE_IDLE_TIMEOUT - elapsed).await;
    }
}

/// One direction of a splice: read until EOF, writing every chunk through, then
/// propagate the half-close by shutting down the destination's write half.
async fn pump<R, W>(
    r: &mut R,
    w: &mut W,
    activity: &parking_lot::Mutex<tokio::time::Instant>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n]).await?;
        total += n as u64;
        *activity.lock() = tokio::time::Instant::now();
    }
    let _ = w.shutdown().await;
    Ok(total)
}

/// Read a single byte
pub async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0])
}

/// Read 2 bytes as u16 big-endian
pub async fn read_u16_be<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

/// Write u16 as 2 bytes big-endian
pub async fn write_u16_be<W: AsyncWrite + Unpin>(writer: &mut W, val: u16) -> Result<()> {
    writer.write_all(&val.to_be_bytes()).await?;
    Ok(())
}
