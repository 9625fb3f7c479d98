//! Remote-side SOCKS5 handshake (C6): dials a `socks5` RemoteProxy and performs
//! the CONNECT handshake on its behalf, grounded on the same wire format as
//! `common::socks` but acting as the client rather than the server.

use crate::common::Address;
use crate::registry::RemoteProxy;
use crate::{PoolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Perform the remote-side SOCKS5 handshake over an already-connected stream:
/// `05 02 00 02` (offer no-auth and user/pass), optional RFC 1929 sub-negotiation,
/// then CONNECT to `target`.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    remote: &RemoteProxy,
    target: &Address,
    target_port: u16,
) -> Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, 0x02, AUTH_NONE, AUTH_PASSWORD])
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("send greeting: {}", e)))?;

    let mut method_reply = [0u8; 2];
    stream
        .read_exact(&mut method_reply)
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("read method reply: {}", e)))?;

    if method_reply[0] != SOCKS5_VERSION {
        return Err(PoolError::remote_handshake_failed("unexpected SOCKS version in reply"));
    }

    match method_reply[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD => authenticate(stream, remote).await?,
        AUTH_NO_ACCEPTABLE => {
            return Err(PoolError::remote_handshake_failed("no acceptable auth method"))
        }
        other => {
            return Err(PoolError::remote_handshake_failed(format!(
                "unsupported auth method {}",
                other
            )))
        }
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match target {
        Address::Ipv4(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Address::Ipv6(ip) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Address::Domain(domain) => {
            if domain.len() > 255 {
                return Err(PoolError::remote_handshake_failed("domain name too long"));
            }
            request.push(ATYP_DOMAIN);
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("send connect: {}", e)))?;

    let mut reply = [0u8; 4];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("read connect reply: {}", e)))?;

    if reply[0] != SOCKS5_VERSION {
        return Err(PoolError::remote_handshake_failed("unexpected SOCKS version in connect reply"));
    }
    if reply[1] != REP_SUCCESS {
        return Err(PoolError::remote_handshake_failed(format!(
            "CONNECT refused, reply code {}",
            reply[1]
        )));
    }

    // Drain the bound-address portion of the reply; its contents are unused.
    match reply[3] {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
        }
        _ => return Err(PoolError::remote_handshake_failed("unknown address type in reply")),
    }

    Ok(())
}

async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    remote: &RemoteProxy,
) -> Result<()> {
    let user = remote.user.as_deref().unwrap_or("");
    let pass = remote.pass.as_deref().unwrap_or("");
    if user.len() > 255 || pass.len() > 255 {
        return Err(PoolError::remote_handshake_failed("username or password too long"));
    }

    let mut req = vec![0x01u8, user.len() as u8];
    req.extend_from_slice(user.as_bytes());
    req.push(pass.len() as u8);
    req.extend_from_slice(pass.as_bytes());

    stream
        .write_all(&req)
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("send auth: {}", e)))?;

    let mut resp = [0u8; 2];
    stream
        .read_exact(&mut resp)
        .await
        .map_err(|e| PoolError::remote_handshake_failed(format!("read auth response: {}", e)))?;

    if resp != [0x01, 0x00] {
        return Err(PoolError::remote_handshake_failed("remote rejected user/pass auth"));
    }
    Ok(())
}
