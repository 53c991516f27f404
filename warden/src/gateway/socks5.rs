//! RFC 1928 subset: version negotiation (no-auth only), CONNECT only,
//! IPv4/domain address types. IPv6 and every other command are rejected
//! with the matching SOCKS5 reply code rather than silently dropped.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use warden_shared::FirewallDecision;

use crate::decision::Decider;

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Literal `0.0.0.0:0` bound-address field. We never advertise a real local
/// address back to the client — it has no use for it here.
fn reply(code: u8) -> [u8; 10] {
    [VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[derive(Debug)]
pub enum Destination {
    Ip(String),
    Domain(String),
}

impl Destination {
    pub fn as_str(&self) -> &str {
        match self {
            Destination::Ip(s) | Destination::Domain(s) => s,
        }
    }
}

/// Per-connection stats the caller may want for logging.
pub struct SessionOutcome {
    pub dest: String,
    pub port: u16,
    pub decision: Option<FirewallDecision>,
}

/// Drive one client connection end to end: handshake, firewall decision,
/// dial, relay. Never propagates protocol errors to the caller — a
/// malformed or truncated handshake just closes the socket, same as the
/// reference implementation treats it as a routine disconnect.
pub async fn handle_client(
    mut client: TcpStream,
    vm_name: &str,
    engine: Arc<Decider>,
    decision_pool: Arc<Semaphore>,
) -> SessionOutcome {
    match try_handle(&mut client, vm_name, engine, decision_pool).await {
        Ok(outcome) => outcome,
        Err(_) => SessionOutcome {
            dest: String::new(),
            port: 0,
            decision: None,
        },
    }
}

async fn try_handle(
    client: &mut TcpStream,
    vm_name: &str,
    engine: Arc<Decider>,
    decision_pool: Arc<Semaphore>,
) -> std::io::Result<SessionOutcome> {
    let version = client.read_u8().await?;
    if version != VERSION {
        return Ok(SessionOutcome { dest: String::new(), port: 0, decision: None });
    }

    let nmethods = client.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods).await?;

    client.write_all(&[VERSION, 0x00]).await?;

    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;
    let (_, cmd, _, atyp) = (header[0], header[1], header[2], header[3]);

    if cmd != CMD_CONNECT {
        client.write_all(&reply(REPLY_COMMAND_NOT_SUPPORTED)).await?;
        return Ok(SessionOutcome { dest: String::new(), port: 0, decision: None });
    }

    let dest = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Destination::Ip(octets.iter().map(u8::to_string).collect::<Vec<_>>().join("."))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await?;
            let mut buf = vec![0u8; len as usize];
            client.read_exact(&mut buf).await?;
            match String::from_utf8(buf) {
                Ok(s) => Destination::Domain(s),
                Err(_) => {
                    client.write_all(&reply(REPLY_ADDRESS_TYPE_NOT_SUPPORTED)).await?;
                    return Ok(SessionOutcome { dest: String::new(), port: 0, decision: None });
                }
            }
        }
        ATYP_IPV6 => {
            client.write_all(&reply(REPLY_ADDRESS_TYPE_NOT_SUPPORTED)).await?;
            return Ok(SessionOutcome { dest: String::new(), port: 0, decision: None });
        }
        _ => {
            client.write_all(&reply(REPLY_ADDRESS_TYPE_NOT_SUPPORTED)).await?;
            return Ok(SessionOutcome { dest: String::new(), port: 0, decision: None });
        }
    };

    let dest_port = client.read_u16().await?;
    let dest_str = dest.as_str().to_string();

    // Bounded worker pool: at most DECISION_POOL_SIZE connections may be
    // inside the (possibly minutes-long) decision call at once. Acquiring
    // the permit here, not around accept(), keeps the accept loop itself
    // unblocked.
    let permit = decision_pool
        .acquire_owned()
        .await
        .expect("decision pool semaphore is never closed");
    let decision = engine.decide(vm_name, &dest_str, dest_port).await;
    drop(permit);

    if decision == FirewallDecision::Deny {
        tracing::info!(target: "warden::firewall", vm = vm_name, dest = %dest_str, port = dest_port, "DENIED");
        client.write_all(&reply(REPLY_CONNECTION_NOT_ALLOWED)).await?;
        return Ok(SessionOutcome { dest: dest_str, port: dest_port, decision: Some(decision) });
    }
    tracing::info!(target: "warden::firewall", vm = vm_name, dest = %dest_str, port = dest_port, "ALLOWED");

    let dest_stream = match TcpStream::connect((dest_str.as_str(), dest_port)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "warden::proxy", vm = vm_name, dest = %dest_str, port = dest_port, error = %e, "dial failed");
            client.write_all(&reply(REPLY_CONNECTION_REFUSED)).await?;
            return Ok(SessionOutcome { dest: dest_str, port: dest_port, decision: Some(decision) });
        }
    };

    client.write_all(&reply(REPLY_SUCCEEDED)).await?;

    relay(client, dest_stream).await;

    Ok(SessionOutcome { dest: dest_str, port: dest_port, decision: Some(decision) })
}

/// Bidirectional relay that cancels its peer on first completion, rather
/// than waiting for both halves to see EOF independently (a half-closed TCP
/// connection would otherwise pin the task open indefinitely).
async fn relay(client: &mut TcpStream, mut upstream: TcpStream) {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_encodes_fixed_bound_address() {
        let r = reply(REPLY_SUCCEEDED);
        assert_eq!(r, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn deny_reply_uses_connection_not_allowed_code() {
        let r = reply(REPLY_CONNECTION_NOT_ALLOWED);
        assert_eq!(r[1], 0x02);
    }
}
