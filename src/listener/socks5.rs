//! Client-facing SOCKS5 handler: no-auth negotiation, CONNECT-only, grounded
//! on `inbound::mixed::handle_socks5` with authentication stripped (spec:
//! listener endpoints are unauthenticated) and the LRU remote wired in place
//! of the teacher's rule-based `ProxyManager`.

use crate::common::socks::{
    AuthRequest, AuthResponse, Command, Request, Response, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    REP_COMMAND_NOT_SUPPORTED, REP_GENERAL_FAILURE,
};
use crate::common::Address;
use crate::pool::Outcome;
use crate::registry::RemoteProxy;
use crate::statistic::Statistics;
use crate::tunnel;
use std::net::Ipv4Addr;
use tokio::net::TcpStream;
use tracing::debug;

pub async fn handle(stream: &mut TcpStream, remote: &RemoteProxy, stats: &Statistics) -> Outcome {
    match handle_inner(stream, remote, stats).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(error = %e, "socks5 listener handler failed");
            Outcome::ClientFailed
        }
    }
}

async fn handle_inner(
    stream: &mut TcpStream,
    remote: &RemoteProxy,
    stats: &Statistics,
) -> crate::Result<Outcome> {
    let auth_req = AuthRequest::read_from(stream).await?;
    if !auth_req.supports(AUTH_NO_AUTH) {
        AuthResponse::new(AUTH_NO_ACCEPTABLE).write_to(stream).await?;
        return Ok(Outcome::ClientFailed);
    }
    AuthResponse::new(AUTH_NO_AUTH).write_to(stream).await?;

    let request = Request::read_from(stream).await?;
    if request.command != Command::Connect {
        Response::failure(REP_COMMAND_NOT_SUPPORTED)
            .write_to(stream)
            .await?;
        return Ok(Outcome::ClientFailed);
    }

    stats.record_request();
    match tunnel::dial_and_handshake(remote, &request.address, request.port).await {
        Ok(mut remote_stream) => {
            Response::success(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
                .write_to(stream)
                .await?;
            Ok(tunnel::splice(stream, &mut remote_stream, stats).await)
        }
        Err(e) => {
            Response::failure(REP_GENERAL_FAILURE).write_to(stream).await?;
            debug!(error = %e, "remote handshake failed");
            Ok(Outcome::RemoteFailed)
        }
    }
}
