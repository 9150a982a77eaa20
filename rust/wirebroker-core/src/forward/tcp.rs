//! TCP forwarder
//!
//! Registered as the stack's TCP transport-protocol handler. For each
//! intercepted SYN: dial the rewritten destination on the host within
//! `ConnTimeout` (resetting the client on failure), complete the inbound
//! handshake within `CatchTimeout` (closing the outbound on failure), arm
//! keepalives on both legs, then splice until a side closes or the client
//! stops answering probes.

use crate::config::ForwardConfig;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};
use wirebroker_netstack::{Stack, TcpFlow, TcpForwardRequest, TcpHandler};

const SPLICE_BUF: usize = 65535;

enum SpliceEnd {
    Eof,
    Reset,
    KeepaliveExhausted,
    HostError,
}

pub struct TcpForwarder {
    stack: Stack,
    conn_timeout: Duration,
    catch_timeout: Duration,
    keepalive_idle: Duration,
    keepalive_interval: Duration,
    keepalive_count: u32,
}

impl TcpForwarder {
    pub fn new(stack: Stack, config: &ForwardConfig) -> Self {
        Self {
            stack,
            conn_timeout: Duration::from_millis(config.conn_timeout_ms),
            catch_timeout: Duration::from_millis(config.catch_timeout_ms),
            keepalive_idle: Duration::from_secs(config.keepalive_idle_secs),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            keepalive_count: config.keepalive_count,
        }
    }

    async fn forward(&self, request: TcpForwardRequest) {
        let client = request.client();
        let target = request.target();

        // The accept critical section runs under the shared stack lock.
        let guard = self.stack.lock().lock().await;

        let stream = match timeout(self.conn_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!("dial {} for {} failed: {}", target, client, err);
                drop(guard);
                request.reset().await;
                return;
            }
            Err(_) => {
                debug!("dial {} for {} timed out", target, client);
                drop(guard);
                request.reset().await;
                return;
            }
        };

        let keepalive = TcpKeepalive::new()
            .with_time(self.keepalive_idle)
            .with_interval(self.keepalive_interval)
            .with_retries(self.keepalive_count);
        if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!("keepalive setup for {} failed: {}", target, err);
        }

        let flow = match request.accept().await {
            Ok(flow) => flow,
            Err(err) => {
                debug!("accept for {} failed: {}", client, err);
                drop(guard);
                return;
            }
        };

        if timeout(self.catch_timeout, flow.wait_established())
            .await
            .map_or(true, |r| r.is_err())
        {
            debug!("client {} did not complete handshake", client);
            drop(guard);
            flow.reset().await;
            return;
        }

        drop(guard);
        trace!("splicing {} <-> {}", client, target);

        let (read_half, write_half) = stream.into_split();
        let flow = Arc::new(flow);

        let inbound = {
            let flow = flow.clone();
            let idle = self.keepalive_idle;
            let interval = self.keepalive_interval;
            let count = self.keepalive_count;
            tokio::spawn(client_to_host(flow, write_half, idle, interval, count))
        };
        let outbound = {
            let flow = flow.clone();
            tokio::spawn(host_to_client(flow, read_half))
        };

        let end = inbound.await.unwrap_or(SpliceEnd::Reset);
        match end {
            SpliceEnd::Eof => {
                // Half-close: let the host finish talking.
                let _ = outbound.await;
            }
            SpliceEnd::Reset | SpliceEnd::KeepaliveExhausted | SpliceEnd::HostError => {
                outbound.abort();
                let _ = outbound.await;
            }
        }

        flow.close().await;
        if matches!(end, SpliceEnd::KeepaliveExhausted | SpliceEnd::Reset) {
            flow.reset().await;
        }
        trace!("flow {} <-> {} finished", client, target);
    }
}

async fn client_to_host(
    flow: Arc<TcpFlow>,
    mut host: OwnedWriteHalf,
    idle: Duration,
    interval: Duration,
    count: u32,
) -> SpliceEnd {
    let mut buf = vec![0u8; SPLICE_BUF];
    let mut misses: u32 = 0;
    loop {
        let wait = if misses == 0 { idle } else { interval };
        match timeout(wait, flow.read(&mut buf)).await {
            Ok(Ok(0)) => {
                let _ = host.shutdown().await;
                return SpliceEnd::Eof;
            }
            Ok(Ok(n)) => {
                misses = 0;
                if host.write_all(&buf[..n]).await.is_err() {
                    return SpliceEnd::HostError;
                }
            }
            Ok(Err(_)) => return SpliceEnd::Reset,
            Err(_) => {
                // Probe responses are bare ACKs that never reach read();
                // the flow's activity clock tells them apart from silence.
                if flow.idle_time() < wait {
                    misses = 0;
                } else {
                    misses += 1;
                    if misses > count {
                        debug!("client {} exhausted {} keepalives", flow.client(), count);
                        return SpliceEnd::KeepaliveExhausted;
                    }
                }
                if flow.send_keepalive().await.is_err() {
                    return SpliceEnd::Reset;
                }
            }
        }
    }
}

async fn host_to_client(flow: Arc<TcpFlow>, mut host: OwnedReadHalf) {
    let mut buf = vec![0u8; SPLICE_BUF];
    loop {
        match host.read(&mut buf).await {
            Ok(0) | Err(_) => {
                flow.close().await;
                return;
            }
            Ok(n) => {
                if flow.write(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TcpHandler for TcpForwarder {
    async fn handle(&self, request: TcpForwardRequest) {
        self.forward(request).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;
    use wirebroker_netstack::packet::{build_tcp, parse_packet, TcpFlags};
    use wirebroker_netstack::{TransportInfo, Verdict};

    fn forwarder_config() -> ForwardConfig {
        ForwardConfig {
            conn_timeout_ms: 500,
            catch_timeout_ms: 500,
            keepalive_idle_secs: 60,
            keepalive_interval_secs: 60,
            keepalive_count: 3,
        }
    }

    fn stack_with_dnat(target: SocketAddr) -> Stack {
        let stack = Stack::new(1420, vec!["192.168.0.2".parse().unwrap()]);
        stack.set_promiscuous(true);
        let SocketAddr::V4(v4) = target else { panic!() };
        let table = crate::mapping::build_table(
            crate::mapping::AliasPrefix::parse("10.9.8").unwrap(),
            &[(1, *v4.ip(), v4.port())],
        );
        stack.replace_nat_table(table, false).unwrap();
        stack
    }

    async fn drive_syn(stack: &Stack, client: SocketAddr, alias: SocketAddr) {
        let syn = build_tcp(
            client,
            alias,
            9000,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            Some(1380),
        );
        stack.inject(&syn).await;
    }

    // Scenario: dial to a blackholed target resets the inbound SYN and
    // leaves no flow behind.
    #[tokio::test(flavor = "multi_thread")]
    async fn dial_failure_resets_client() {
        // A closed port on localhost refuses immediately.
        let refused: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let stack = stack_with_dnat(refused);
        let mut outbound = stack.take_outbound().unwrap();
        stack.set_tcp_handler(Arc::new(TcpForwarder::new(stack.clone(), &forwarder_config())));

        let client: SocketAddr = "192.168.0.1:4000".parse().unwrap();
        let alias = SocketAddr::new(Ipv4Addr::new(10, 9, 8, 1).into(), 1);
        drive_syn(&stack, client, alias).await;

        let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .expect("expected a reply")
            .unwrap();
        let parsed = parse_packet(&reply).unwrap();
        match parsed.transport {
            TransportInfo::Tcp(ref t) => assert!(t.flags.rst),
            ref other => panic!("expected rst, got {:?}", other),
        }
        assert_eq!(parsed.src_socket().unwrap(), alias);
    }

    // Full path: SYN to the alias lands on a live listener; handshake
    // completes, payload crosses both ways.
    #[tokio::test(flavor = "multi_thread")]
    async fn syn_to_live_listener_establishes_and_splices() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let stack = stack_with_dnat(target);
        let mut outbound = stack.take_outbound().unwrap();
        stack.set_tcp_handler(Arc::new(TcpForwarder::new(stack.clone(), &forwarder_config())));

        let client: SocketAddr = "192.168.0.1:4000".parse().unwrap();
        let alias = SocketAddr::new(Ipv4Addr::new(10, 9, 8, 1).into(), target.port());

        // The table DNATs alias:port -> 127.0.0.1:port.
        assert_eq!(
            stack.nat_table(false).check(
                wirebroker_netstack::Hook::Prerouting,
                &parse_packet(&build_tcp(
                    client,
                    alias,
                    1,
                    0,
                    TcpFlags { syn: true, ..Default::default() },
                    65535,
                    &[],
                    None
                ))
                .unwrap()
            ),
            Verdict::Dnat { addr: "127.0.0.1".parse().unwrap(), port: target.port() }
        );

        drive_syn(&stack, client, alias).await;

        // SYN-ACK comes back from the alias.
        let syn_ack = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed = parse_packet(&syn_ack).unwrap();
        let TransportInfo::Tcp(t) = &parsed.transport else { panic!() };
        assert!(t.flags.syn && t.flags.ack);
        let server_seq = t.seq;

        // Complete the handshake and push one segment.
        let ack = build_tcp(
            client,
            alias,
            9001,
            server_seq.wrapping_add(1),
            TcpFlags::ack_only(),
            65535,
            &[],
            None,
        );
        stack.inject(&ack).await;
        let data = build_tcp(
            client,
            alias,
            9001,
            server_seq.wrapping_add(1),
            TcpFlags::psh_ack(),
            65535,
            b"echo me",
            None,
        );
        stack.inject(&data).await;

        // Expect an ACK for the payload and then the echoed bytes.
        let mut echoed = None;
        for _ in 0..4 {
            let pkt = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
                .await
                .unwrap()
                .unwrap();
            let parsed = parse_packet(&pkt).unwrap();
            if let TransportInfo::Tcp(t) = &parsed.transport {
                let start = parsed.payload_offset + t.header_len;
                let end = parsed.payload_offset + parsed.ip_payload_len;
                if end > start {
                    echoed = Some(pkt[start..end].to_vec());
                    break;
                }
            }
        }
        assert_eq!(echoed.as_deref(), Some(&b"echo me"[..]));
        echo.await.unwrap();
    }
}
