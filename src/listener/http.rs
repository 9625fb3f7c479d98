//! Client-facing HTTP proxy handler: `CONNECT host:port` tunneling and
//! absolute-form `GET http://host/path ...` proxying, grounded on
//! `inbound::mixed::handle_http` with auth and the old tunnel dialer dropped.

use crate::common::Address;
use crate::pool::Outcome;
use crate::registry::RemoteProxy;
use crate::statistic::Statistics;
use crate::tunnel;
use crate::{PoolError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

pub async fn handle(stream: &mut TcpStream, remote: &RemoteProxy, stats: &Statistics) -> Outcome {
    match handle_inner(stream, remote, stats).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(error = %e, "http listener handler failed");
            Outcome::ClientFailed
        }
    }
}

async fn handle_inner(
    stream: &mut TcpStream,
    remote: &RemoteProxy,
    stats: &Statistics,
) -> Result<Outcome> {
    let mut reader = BufReader::new(&mut *stream);

    let mut first_line = String::new();
    reader.read_line(&mut first_line).await?;
    let first_line = first_line.trim();
    if first_line.is_empty() {
        return Err(PoolError::client_protocol("empty request line"));
    }

    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(PoolError::client_protocol("malformed HTTP request line"));
    }
    let method = parts[0].to_string();
    let uri = parts[1].to_string();

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(colon) = line.find(':') {
            headers.push((
                line[..colon].trim().to_lowercase(),
                line[colon + 1..].trim().to_string(),
            ));
        }
    }

    // The BufReader may have pulled bytes past the blank line into its internal
    // buffer (e.g. a request body arriving in the same segment as the headers).
    // Capture them before dropping the reader so they aren't lost once we go
    // back to reading/writing `stream` directly.
    let leftover = reader.buffer().to_vec();
    drop(reader);

    stats.record_request();

    if method == "CONNECT" {
        let (host, port) = parse_host_port(&uri)?;
        match tunnel::dial_and_handshake(remote, &Address::Domain(host.clone()), port).await {
            Ok(mut remote_stream) => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                if !leftover.is_empty() {
                    remote_stream.write_all(&leftover).await?;
                }
                Ok(tunnel::splice(stream, &mut remote_stream, stats).await)
            }
            Err(e) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                    .await;
                debug!(error = %e, host, port, "remote handshake failed");
                Ok(Outcome::RemoteFailed)
            }
        }
    } else {
        let (host, port, path) = parse_absolute_form(&uri)?;

        match tunnel::dial_and_handshake(remote, &Address::Domain(host.clone()), port).await {
            Ok(mut remote_stream) => {
                let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
                request.push_str(&format!("Host: {}:{}\r\n", host, port));
                for (key, value) in &headers {
                    if key != "host" && !is_hop_by_hop_header(key) {
                        request.push_str(&format!("{}: {}\r\n", key, value));
                    }
                }
                request.push_str("Connection: close\r\n\r\n");
                remote_stream.write_all(request.as_bytes()).await?;
                if !leftover.is_empty() {
                    remote_stream.write_all(&leftover).await?;
                }

                Ok(tunnel::splice(stream, &mut remote_stream, stats).await)
            }
            Err(e) => {
                let _ = stream
                    .write_all(b"HTTP/1.1 502 Bad Gateway\r\nConnection: close\r\n\r\n")
                    .await;
                debug!(error = %e, host, port, "remote handshake failed");
                Ok(Outcome::RemoteFailed)
            }
        }
    }
}

fn parse_host_port(uri: &str) -> Result<(String, u16)> {
    let (host, port) = uri
        .rsplit_once(':')
        .ok_or_else(|| PoolError::client_protocol("CONNECT target missing port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| PoolError::client_protocol("CONNECT target has invalid port"))?;
    Ok((host.to_string(), port))
}

/// `GET http://host[:port]/path HTTP/1.1` -> (host, port, "/path").
fn parse_absolute_form(uri: &str) -> Result<(String, u16, String)> {
    let rest = uri
        .strip_prefix("http://")
        .ok_or_else(|| PoolError::client_protocol("only absolute-form http:// URIs are supported"))?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse()
                .map_err(|_| PoolError::client_protocol("invalid port in absolute-form URI"))?,
        ),
        None => (authority.to_string(), 80u16),
    };
    Ok((host, port, path))
}

fn is_hop_by_hop_header(header: &str) -> bool {
    matches!(
        header,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "proxy-connection"
    )
}
