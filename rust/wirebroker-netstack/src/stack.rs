//! Userspace stack coordinator
//!
//! One virtual interface per stack. The tunnel device injects decrypted IP
//! packets with [`Stack::inject`] and drains the interface's outbound queue
//! via [`Stack::take_outbound`]. Inbound packets traverse the NAT table,
//! then are delivered to bound sockets, the registered transport handlers,
//! or the ICMP intake; non-local packets are forwarded back out when
//! forwarding is enabled for their family.
//!
//! Traffic belonging to flows the stack itself terminates (TCP flow replies,
//! socket sends, echo replies) leaves through the interface directly, the
//! way conntrack-established packets bypass the NAT rules.

use crate::error::{NetstackError, Result};
use crate::packet::{build_echo_reply, build_udp, parse_packet, rewrite_src, ParsedPacket, TcpFlags, TransportInfo};
use crate::rules::{Hook, RuleTable, Verdict};
use crate::tcp::{FlowKey, FlowShared, TcpForwardRequest, TcpHandler};
use crate::udp::{UdpBindTable, UdpDatagram, UdpHandler, UdpSocket};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use smoltcp::wire::IpVersion;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 1024;
const ICMP_QUEUE_DEPTH: usize = 64;

pub const IPV4_OVERHEAD: usize = 40;
pub const IPV6_OVERHEAD: usize = 60;

/// ICMP echo request surfaced to the broker's ICMP handler.
#[derive(Debug, Clone)]
pub struct EchoRequest {
    /// Requesting client.
    pub src: IpAddr,
    /// Destination as the client addressed it.
    pub dst: IpAddr,
    /// Destination after Prerouting rewriting.
    pub target: IpAddr,
    pub ident: u16,
    pub seq_no: u16,
    pub payload: Bytes,
}

struct StackShared {
    mtu: usize,
    addrs: Arc<RwLock<Vec<IpAddr>>>,
    promiscuous: AtomicBool,
    forwarding_v4: AtomicBool,
    forwarding_v6: AtomicBool,
    nat_v4: RwLock<Arc<RuleTable>>,
    nat_v6: RwLock<Arc<RuleTable>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    outbound_rx: parking_lot::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    udp_binds: Arc<UdpBindTable>,
    tcp_flows: Arc<DashMap<FlowKey, Arc<FlowShared>>>,
    tcp_pending: Arc<DashMap<FlowKey, ()>>,
    tcp_handler: RwLock<Option<Arc<dyn TcpHandler>>>,
    udp_handler: RwLock<Option<Arc<dyn UdpHandler>>>,
    icmp_tx: mpsc::Sender<EchoRequest>,
    icmp_rx: parking_lot::Mutex<Option<mpsc::Receiver<EchoRequest>>>,
    /// Coarse lock serializing stack-level mutations (table swaps, handler
    /// registration, the forwarder's accept critical section). Packet rx/tx
    /// never takes it.
    lock: Mutex<()>,
}

/// The userspace stack. Cheap to clone; all clones share one interface.
#[derive(Clone)]
pub struct Stack {
    shared: Arc<StackShared>,
}

impl Stack {
    pub fn new(mtu: usize, addrs: Vec<IpAddr>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (icmp_tx, icmp_rx) = mpsc::channel(ICMP_QUEUE_DEPTH);
        Self {
            shared: Arc::new(StackShared {
                mtu,
                addrs: Arc::new(RwLock::new(addrs)),
                promiscuous: AtomicBool::new(false),
                forwarding_v4: AtomicBool::new(false),
                forwarding_v6: AtomicBool::new(false),
                nat_v4: RwLock::new(Arc::new(RuleTable::accept_all())),
                nat_v6: RwLock::new(Arc::new(RuleTable::accept_all())),
                outbound_tx,
                outbound_rx: parking_lot::Mutex::new(Some(outbound_rx)),
                udp_binds: Arc::new(UdpBindTable::default()),
                tcp_flows: Arc::new(DashMap::new()),
                tcp_pending: Arc::new(DashMap::new()),
                tcp_handler: RwLock::new(None),
                udp_handler: RwLock::new(None),
                icmp_tx,
                icmp_rx: parking_lot::Mutex::new(Some(icmp_rx)),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn mtu(&self) -> usize {
        self.shared.mtu
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.shared.addrs.read().clone()
    }

    pub fn add_address(&self, addr: IpAddr) {
        let mut addrs = self.shared.addrs.write();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    /// Accept packets whose destination is not one of the interface
    /// addresses. This is how synthetic alias destinations are delivered.
    pub fn set_promiscuous(&self, enabled: bool) {
        self.shared.promiscuous.store(enabled, Ordering::Relaxed);
    }

    pub fn promiscuous(&self) -> bool {
        self.shared.promiscuous.load(Ordering::Relaxed)
    }

    pub fn set_forwarding(&self, version: IpVersion, enabled: bool) {
        let flag = match version {
            IpVersion::Ipv4 => &self.shared.forwarding_v4,
            IpVersion::Ipv6 => &self.shared.forwarding_v6,
        };
        flag.store(enabled, Ordering::Relaxed);
    }

    pub fn forwarding(&self, version: IpVersion) -> bool {
        match version {
            IpVersion::Ipv4 => self.shared.forwarding_v4.load(Ordering::Relaxed),
            IpVersion::Ipv6 => self.shared.forwarding_v6.load(Ordering::Relaxed),
        }
    }

    /// The coarse external lock. Held by callers for stack-level mutations,
    /// never by the packet paths.
    pub fn lock(&self) -> &Mutex<()> {
        &self.shared.lock
    }

    /// Atomically replace a NAT table. In-flight packets keep the table they
    /// started with.
    pub fn replace_nat_table(&self, table: RuleTable, ipv6: bool) -> Result<()> {
        table
            .validate()
            .map_err(NetstackError::TableRejected)?;
        let slot = if ipv6 { &self.shared.nat_v6 } else { &self.shared.nat_v4 };
        *slot.write() = Arc::new(table);
        Ok(())
    }

    pub fn nat_table(&self, ipv6: bool) -> Arc<RuleTable> {
        if ipv6 {
            self.shared.nat_v6.read().clone()
        } else {
            self.shared.nat_v4.read().clone()
        }
    }

    pub fn set_tcp_handler(&self, handler: Arc<dyn TcpHandler>) {
        *self.shared.tcp_handler.write() = Some(handler);
    }

    pub fn set_udp_handler(&self, handler: Arc<dyn UdpHandler>) {
        *self.shared.udp_handler.write() = Some(handler);
    }

    /// Bind a userspace datagram socket. An unspecified address claims the
    /// port on every interface address.
    pub fn udp_bind(&self, local: SocketAddr) -> Result<UdpSocket> {
        let rx = self.shared.udp_binds.bind(local)?;
        Ok(UdpSocket::new(
            local,
            rx,
            self.shared.outbound_tx.clone(),
            self.shared.udp_binds.clone(),
            self.shared.addrs.clone(),
            self.shared.mtu,
        ))
    }

    /// Take the interface's outbound queue; drained by the tunnel device.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.shared.outbound_rx.lock().take()
    }

    /// Take the ICMP echo intake; drained by the broker's ICMP handler.
    pub fn take_echo_requests(&self) -> Option<mpsc::Receiver<EchoRequest>> {
        self.shared.icmp_rx.lock().take()
    }

    /// Emit an echo reply into the interface, mirroring a consumed request.
    pub async fn send_echo_reply(&self, request: &EchoRequest, payload: &[u8]) -> Result<()> {
        let pkt = build_echo_reply(request.dst, request.src, request.ident, request.seq_no, payload);
        if pkt.is_empty() {
            return Err(NetstackError::Unsupported("mixed address families".into()));
        }
        self.shared
            .outbound_tx
            .send(pkt)
            .await
            .map_err(|_| NetstackError::ChannelClosed)
    }

    /// Emit a UDP datagram into the interface. Used by the UDP forwarder to
    /// return host traffic under the alias source.
    pub async fn send_udp(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<()> {
        let pkt = build_udp(src, dst, payload);
        if pkt.is_empty() {
            return Err(NetstackError::Unsupported("mixed address families".into()));
        }
        self.shared
            .outbound_tx
            .send(pkt)
            .await
            .map_err(|_| NetstackError::ChannelClosed)
    }

    fn is_local(&self, addr: IpAddr) -> bool {
        self.shared.addrs.read().contains(&addr) || self.promiscuous()
    }

    fn default_mss(&self, client: SocketAddr) -> u16 {
        let overhead = if client.is_ipv4() { IPV4_OVERHEAD } else { IPV6_OVERHEAD };
        self.shared.mtu.saturating_sub(overhead).max(536) as u16
    }

    /// Inject one IP packet from the tunnel device.
    pub async fn inject(&self, raw: &[u8]) {
        let parsed = match parse_packet(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!("dropping unparseable packet: {}", err);
                return;
            }
        };

        let table = self.nat_table(parsed.version == IpVersion::Ipv6);
        let target = match table.check(Hook::Prerouting, &parsed) {
            Verdict::Drop => {
                trace!(
                    "prerouting drop: {} -> {}",
                    parsed.src_addr,
                    parsed.dst_addr
                );
                return;
            }
            Verdict::Dnat { addr, port } => Some(SocketAddr::new(IpAddr::V4(addr), port)),
            Verdict::Accept | Verdict::Masquerade => None,
        };

        if self.is_local(parsed.dst_addr) {
            if table.check(Hook::Input, &parsed) == Verdict::Drop {
                return;
            }
            self.deliver_local(raw, &parsed, target).await;
        } else if self.forwarding(parsed.version) {
            self.forward(raw, &parsed, &table).await;
        } else {
            trace!("no route to {} and forwarding disabled", parsed.dst_addr);
        }
    }

    async fn deliver_local(&self, raw: &[u8], parsed: &ParsedPacket, target: Option<SocketAddr>) {
        match &parsed.transport {
            TransportInfo::Tcp(tcp) => {
                let (Some(src), Some(alias)) = (parsed.src_socket(), parsed.dst_socket()) else {
                    return;
                };
                let target = target.unwrap_or(alias);
                let payload_start = parsed.payload_offset + tcp.header_len;
                let payload_end = parsed.payload_offset + parsed.ip_payload_len;
                let payload = raw
                    .get(payload_start..payload_end.min(raw.len()))
                    .unwrap_or(&[]);
                self.deliver_tcp(src, alias, target, tcp, payload).await;
            }
            TransportInfo::Udp(udp) => {
                let (Some(src), Some(alias)) = (parsed.src_socket(), parsed.dst_socket()) else {
                    return;
                };
                let target = target.unwrap_or(alias);
                let payload_start = parsed.payload_offset + crate::packet::UDP_HEADER_LEN;
                let payload = raw
                    .get(payload_start..(payload_start + udp.payload_len).min(raw.len()))
                    .unwrap_or(&[]);
                let payload = Bytes::copy_from_slice(payload);

                if self.shared.udp_binds.deliver(src, alias, payload.clone()) {
                    return;
                }
                let handler = self.shared.udp_handler.read().clone();
                if let Some(handler) = handler {
                    let datagram = UdpDatagram {
                        src,
                        alias_dst: alias,
                        target,
                        payload,
                    };
                    tokio::spawn(async move { handler.handle(datagram).await });
                } else {
                    trace!("no udp handler, dropping datagram for {}", alias);
                }
            }
            TransportInfo::IcmpEchoRequest(echo) => {
                let payload = raw
                    .get(parsed.payload_offset + echo.payload_offset..)
                    .unwrap_or(&[]);
                let request = EchoRequest {
                    src: parsed.src_addr,
                    dst: parsed.dst_addr,
                    target: target.map(|t| t.ip()).unwrap_or(parsed.dst_addr),
                    ident: echo.ident,
                    seq_no: echo.seq_no,
                    payload: Bytes::copy_from_slice(payload),
                };
                if self.shared.icmp_tx.try_send(request).is_err() {
                    trace!("icmp intake full, dropping echo request");
                }
            }
            _ => {}
        }
    }

    async fn deliver_tcp(
        &self,
        src: SocketAddr,
        alias: SocketAddr,
        target: SocketAddr,
        tcp: &crate::packet::TcpInfo,
        payload: &[u8],
    ) {
        let key = FlowKey { client: src, alias };

        if let Some(flow) = self.shared.tcp_flows.get(&key).map(|f| f.clone()) {
            flow.handle_segment(tcp, payload).await;
            return;
        }

        if tcp.flags.syn && !tcp.flags.ack {
            if self.shared.tcp_pending.insert(key, ()).is_some() {
                // A retransmitted SYN while the forwarder decides.
                return;
            }
            let handler = self.shared.tcp_handler.read().clone();
            let Some(handler) = handler else {
                self.shared.tcp_pending.remove(&key);
                self.send_rst(src, alias, tcp).await;
                return;
            };
            let request = TcpForwardRequest {
                key,
                target,
                client_isn: tcp.seq,
                mss: tcp.mss,
                default_mss: self.default_mss(src),
                outbound: self.shared.outbound_tx.clone(),
                flows: self.shared.tcp_flows.clone(),
                pending: self.shared.tcp_pending.clone(),
            };
            debug!("tcp syn: {} -> {} (target {})", src, alias, target);
            tokio::spawn(async move { handler.handle(request).await });
            return;
        }

        if !tcp.flags.rst {
            self.send_rst(src, alias, tcp).await;
        }
    }

    async fn send_rst(&self, src: SocketAddr, alias: SocketAddr, tcp: &crate::packet::TcpInfo) {
        let pkt = if tcp.flags.ack {
            crate::packet::build_tcp(alias, src, tcp.ack, 0, TcpFlags::rst_only(), 0, &[], None)
        } else {
            crate::packet::build_tcp(
                alias,
                src,
                0,
                tcp.seq.wrapping_add(1),
                TcpFlags::rst_ack(),
                0,
                &[],
                None,
            )
        };
        let _ = self.shared.outbound_tx.send(pkt).await;
    }

    async fn forward(&self, raw: &[u8], parsed: &ParsedPacket, table: &RuleTable) {
        if table.check(Hook::Forward, parsed) == Verdict::Drop {
            return;
        }

        let mut out = raw.to_vec();
        if table.check(Hook::Postrouting, parsed) == Verdict::Masquerade {
            let source = {
                let addrs = self.shared.addrs.read();
                addrs
                    .iter()
                    .find(|a| a.is_ipv4() == (parsed.version == IpVersion::Ipv4))
                    .copied()
            };
            if let Some(source) = source {
                if let Err(err) = rewrite_src(&mut out, parsed, source) {
                    warn!("masquerade rewrite failed: {}", err);
                    return;
                }
            }
        }

        if self.shared.outbound_tx.send(out).await.is_err() {
            warn!("outbound queue closed while forwarding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_tcp, build_udp, parse_packet};
    use crate::rules::{IpHeaderFilter, Rule, RuleMatcher, RuleTarget};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_stack() -> Stack {
        Stack::new(1420, vec!["192.168.0.2".parse().unwrap(), "fd:face::2".parse().unwrap()])
    }

    fn dnat_table(alias: Ipv4Addr, target: Ipv4Addr, port: u16) -> RuleTable {
        RuleTable {
            rules: vec![
                Rule {
                    filter: IpHeaderFilter::dst_host(alias),
                    matchers: vec![RuleMatcher::TcpPort { port }],
                    target: RuleTarget::DnatV4 { addr: target, port },
                },
                Rule::drop(),
                Rule::accept(),
                Rule::accept(),
                Rule::accept(),
                Rule {
                    filter: IpHeaderFilter {
                        protocol: Some(smoltcp::wire::IpProtocol::Tcp),
                        check_protocol: false,
                        dst: None,
                    },
                    matchers: Vec::new(),
                    target: RuleTarget::Masquerade,
                },
                Rule::accept(),
            ],
            builtin_chains: [0, 2, 3, 4, 5],
        }
    }

    struct ChannelHandler {
        tx: mpsc::Sender<TcpForwardRequest>,
    }

    #[async_trait]
    impl TcpHandler for ChannelHandler {
        async fn handle(&self, request: TcpForwardRequest) {
            let _ = self.tx.send(request).await;
        }
    }

    #[tokio::test]
    async fn udp_socket_loopback() {
        let stack = test_stack();
        let mut outbound = stack.take_outbound().unwrap();
        let socket = stack
            .udp_bind("0.0.0.0:51821".parse().unwrap())
            .unwrap();

        let inbound = build_udp(
            "192.168.0.1:9000".parse().unwrap(),
            "192.168.0.2:51821".parse().unwrap(),
            b"nested",
        );
        stack.inject(&inbound).await;

        let mut buf = [0u8; 64];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"nested");
        assert_eq!(peer, "192.168.0.1:9000".parse().unwrap());

        socket.send_to(b"pong", peer).await.unwrap();
        let out = outbound.recv().await.unwrap();
        let parsed = parse_packet(&out).unwrap();
        // Unspecified bind picks the interface address for the reply source.
        assert_eq!(parsed.src_socket().unwrap(), "192.168.0.2:51821".parse().unwrap());
        assert_eq!(parsed.dst_socket().unwrap(), peer);
    }

    #[tokio::test]
    async fn syn_is_steered_to_handler_with_rewritten_target() {
        let stack = test_stack();
        let mut outbound = stack.take_outbound().unwrap();
        stack.set_promiscuous(true);

        let alias = Ipv4Addr::new(10, 9, 8, 1);
        let target = Ipv4Addr::new(93, 184, 216, 34);
        stack
            .replace_nat_table(dnat_table(alias, target, 80), false)
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        stack.set_tcp_handler(Arc::new(ChannelHandler { tx }));

        let syn = build_tcp(
            "192.168.0.1:4000".parse().unwrap(),
            SocketAddr::new(alias.into(), 80),
            7000,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            Some(1400),
        );
        stack.inject(&syn).await;

        let request = rx.recv().await.unwrap();
        assert_eq!(request.client(), "192.168.0.1:4000".parse().unwrap());
        assert_eq!(request.alias(), SocketAddr::new(alias.into(), 80));
        assert_eq!(request.target(), SocketAddr::new(target.into(), 80));

        let flow = request.accept().await.unwrap();
        let syn_ack = outbound.recv().await.unwrap();
        let parsed = parse_packet(&syn_ack).unwrap();
        assert_eq!(parsed.src_socket().unwrap(), flow.alias());
        drop(flow);
    }

    #[tokio::test]
    async fn unmapped_alias_port_is_dropped() {
        let stack = test_stack();
        let mut outbound = stack.take_outbound().unwrap();
        stack.set_promiscuous(true);

        let alias = Ipv4Addr::new(10, 9, 8, 1);
        stack
            .replace_nat_table(dnat_table(alias, Ipv4Addr::new(93, 184, 216, 34), 80), false)
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        stack.set_tcp_handler(Arc::new(ChannelHandler { tx }));

        let syn = build_tcp(
            "192.168.0.1:4000".parse().unwrap(),
            SocketAddr::new(alias.into(), 8080),
            7000,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            None,
        );
        stack.inject(&syn).await;

        // Neither a handler call nor a reply; the packet died in Prerouting.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(50), outbound.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn nonlocal_packet_forwarded_only_when_enabled() {
        let stack = test_stack();
        let mut outbound = stack.take_outbound().unwrap();

        let pkt = build_udp(
            "192.168.0.1:9000".parse().unwrap(),
            "172.16.5.5:7777".parse().unwrap(),
            b"x",
        );

        stack.inject(&pkt).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), outbound.recv())
                .await
                .is_err()
        );

        stack.set_forwarding(IpVersion::Ipv4, true);
        stack.inject(&pkt).await;
        let out = outbound.recv().await.unwrap();
        assert_eq!(out, pkt);
    }

    #[tokio::test]
    async fn forwarded_packet_masqueraded_by_postrouting() {
        let stack = test_stack();
        let mut outbound = stack.take_outbound().unwrap();
        stack.set_forwarding(IpVersion::Ipv4, true);
        // Open Prerouting, MASQUERADE in Postrouting.
        let table = RuleTable {
            rules: vec![
                Rule::accept(),
                Rule::accept(),
                Rule::accept(),
                Rule::accept(),
                Rule {
                    filter: IpHeaderFilter {
                        protocol: Some(smoltcp::wire::IpProtocol::Tcp),
                        check_protocol: false,
                        dst: None,
                    },
                    matchers: Vec::new(),
                    target: RuleTarget::Masquerade,
                },
                Rule::accept(),
            ],
            builtin_chains: [0, 1, 2, 3, 4],
        };
        stack.replace_nat_table(table, false).unwrap();

        let pkt = build_udp(
            "192.168.0.1:9000".parse().unwrap(),
            "172.16.5.5:7777".parse().unwrap(),
            b"x",
        );
        stack.inject(&pkt).await;

        let out = outbound.recv().await.unwrap();
        let parsed = parse_packet(&out).unwrap();
        assert_eq!(parsed.src_addr, "192.168.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.dst_addr, "172.16.5.5".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn echo_request_surfaces_and_reply_mirrors_it() {
        let stack = test_stack();
        let mut outbound = stack.take_outbound().unwrap();
        let mut echoes = stack.take_echo_requests().unwrap();
        stack.set_promiscuous(true);

        // Hand-build an echo request 192.168.0.1 -> 10.9.8.1.
        let reply_shape = crate::packet::build_echo_reply(
            "192.168.0.1".parse().unwrap(),
            "10.9.8.1".parse().unwrap(),
            42,
            7,
            b"abcd",
        );
        let mut raw = reply_shape;
        raw[20] = 8; // echo request type
        raw[22..24].copy_from_slice(&[0, 0]);
        let sum = {
            let mut s = 0u32;
            for i in (20..raw.len()).step_by(2) {
                let w = if i + 1 < raw.len() {
                    ((raw[i] as u32) << 8) | raw[i + 1] as u32
                } else {
                    (raw[i] as u32) << 8
                };
                s = s.wrapping_add(w);
            }
            while s >> 16 != 0 {
                s = (s & 0xFFFF) + (s >> 16);
            }
            !(s as u16)
        };
        raw[22..24].copy_from_slice(&sum.to_be_bytes());

        stack.inject(&raw).await;
        let request = echoes.recv().await.unwrap();
        assert_eq!(request.ident, 42);
        assert_eq!(request.seq_no, 7);
        assert_eq!(request.payload.as_ref(), b"abcd");

        stack.send_echo_reply(&request, &request.payload.clone()).await.unwrap();
        let out = outbound.recv().await.unwrap();
        let parsed = parse_packet(&out).unwrap();
        assert_eq!(parsed.src_addr, "10.9.8.1".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.dst_addr, "192.168.0.1".parse::<IpAddr>().unwrap());
    }
}
