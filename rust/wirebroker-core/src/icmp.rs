//! ICMP echo relay
//!
//! Consumes echo requests surfaced by the transport stack, pings the
//! post-DNAT target from the host with an unprivileged ICMP datagram socket,
//! and mirrors a reply into the virtual interface with the client's original
//! identifier and sequence. Reads are lock-free; the task never touches the
//! shared stack lock.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use wirebroker_netstack::{EchoRequest, Stack};

const ECHO_TIMEOUT: Duration = Duration::from_secs(2);
const ECHO_HEADER: usize = 8;

/// Drain echo requests until the stack shuts the intake.
pub async fn run(stack: Stack, mut requests: mpsc::Receiver<EchoRequest>) {
    while let Some(request) = requests.recv().await {
        let stack = stack.clone();
        tokio::spawn(async move {
            trace!(
                "echo {} -> {} (target {}) ident={} seq={}",
                request.src,
                request.dst,
                request.target,
                request.ident,
                request.seq_no
            );
            match host_echo(request.target, request.payload.to_vec()).await {
                Ok(payload) => {
                    if let Err(err) = stack.send_echo_reply(&request, &payload).await {
                        debug!("echo reply injection failed: {}", err);
                    }
                }
                Err(err) => debug!("host echo to {} failed: {}", request.target, err),
            }
        });
    }
}

async fn host_echo(target: IpAddr, payload: Vec<u8>) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || blocking_echo(target, &payload))
        .await
        .map_err(|e| Error::Forward(format!("echo task failed: {}", e)))?
}

// Unprivileged ping: a DGRAM ICMP socket. The kernel owns the identifier
// and checksum; we only match on the reply type and payload.
fn blocking_echo(target: IpAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let (domain, protocol, request_type, reply_type) = match target {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
    socket.set_read_timeout(Some(ECHO_TIMEOUT))?;
    socket.connect(&SocketAddr::new(target, 0).into())?;

    let mut message = vec![0u8; ECHO_HEADER + payload.len()];
    message[0] = request_type;
    message[7] = 1; // sequence
    message[ECHO_HEADER..].copy_from_slice(payload);

    socket.send(&message)?;

    let mut buf = vec![0u8; 2048];
    let n = (&socket).read(&mut buf)?;
    if n < ECHO_HEADER || buf[0] != reply_type {
        return Err(Error::Forward(format!("unexpected icmp reply from {}", target)));
    }
    Ok(buf[ECHO_HEADER..n].to_vec())
}
