//! Remote-side HTTP CONNECT handshake (C6), grounded on `outbound::http`'s
//! `http_connect` but trimmed to the plain-TCP, Basic-auth case this spec needs.

use crate::registry::RemoteProxy;
use crate::{PoolError, Result};
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Send `CONNECT host:port HTTP/1.1` with a Basic `Proxy-Authorization` header and
/// require a `2xx` status line in response.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    remote: &RemoteProxy,
    host: &str,
    port: u16,
) -> Result<()> {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let (Some(user), Some(pass)) = (&remote.user, &remote.pass) {
        let credentials = format!("{}:{}", user, pass);
        let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", encoded));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("send CONNECT: {}", e)))?;

    let mut response = [0u8; 4096];
    let mut total = 0;
    loop {
        if total >= response.len() {
            return Err(PoolError::remote_handshake_failed("CONNECT response too large"));
        }
        let n = stream
            .read(&mut response[total..])
            .await
            .map_err(|e| PoolError::remote_handshake_failed(format!("read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(PoolError::remote_handshake_failed("connection closed during CONNECT"));
        }
        total += n;
        if let Some(header_end) = find_header_end(&response[..total]) {
            let response_str = String::from_utf8_lossy(&response[..header_end]);
            let status_line = response_str.lines().next().unwrap_or("");
            return match status_code(status_line) {
                Some(code) if (200..300).contains(&code) => Ok(()),
                _ => Err(PoolError::remote_handshake_failed(format!(
                    "CONNECT failed: {}",
                    status_line
                ))),
            };
        }
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn status_code(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RemoteKind;
    use tokio::io::duplex;

    fn remote() -> RemoteProxy {
        RemoteProxy {
            id: 0,
            kind: RemoteKind::Http,
            host: "r.example".into(),
            port: 8080,
            user: Some("alice".into()),
            pass: Some("secret".into()),
        }
    }

    #[tokio::test]
    async fn test_connect_with_basic_auth() {
        let (mut client, mut server) = duplex(512);
        let handle = tokio::spawn(async move {
            handshake(&mut client, &remote(), "example.com", 443).await
        });

        let mut buf = vec![0u8; 512];
        let n = server.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]);
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        let expected_auth = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("alice:secret")
        );
        assert!(request.contains(&expected_auth));

        server
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_proxy_auth_required_is_an_error() {
        let (mut client, mut server) = duplex(512);
        let handle = tokio::spawn(async move {
            handshake(&mut client, &remote(), "example.com", 443).await
        });

        let mut buf = vec![0u8; 512];
        server.read(&mut buf).await.unwrap();
        server
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        assert!(handle.await.unwrap().is_err());
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\n"), Some(19));
        assert_eq!(find_header_end(b"incomplete"), None);
    }
}
