//! Server-side TCP for intercepted flows
//!
//! The stack terminates inbound connections itself: on a SYN the registered
//! handler gets a [`TcpForwardRequest`] carrying the tuple before and after
//! Prerouting rewriting, and answers it by `accept()`ing (SYN-ACK) or
//! `reset()`ing the attempt. An accepted [`TcpFlow`] exposes an async
//! read/write surface for splicing.
//!
//! Segments are delivered to the reader strictly in order. Out-of-order
//! segments are answered with a duplicate ACK and discarded, forcing the
//! client to retransmit; the encrypted tunnel link rarely reorders, so no
//! reassembly buffer is kept.

use crate::error::{NetstackError, Result};
use crate::packet::{build_tcp, TcpFlags, TcpInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Inbound flow identity: client tuple and the destination as the client
/// addressed it, before any DNAT rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client: SocketAddr,
    pub alias: SocketAddr,
}

/// Advertised receive window.
pub const RECV_WINDOW: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    Closing,
    TimeWait,
    Closed,
}

struct FlowState {
    state: TcpState,
    snd_nxt: u32,
    snd_una: u32,
    rcv_nxt: u32,
    recv_buf: VecDeque<u8>,
    fin_seen: bool,
    reset: bool,
    /// Last time any segment arrived from the client, keepalive ACKs
    /// included.
    last_activity: Instant,
}

pub(crate) struct FlowShared {
    key: FlowKey,
    target: SocketAddr,
    mss: u16,
    outbound: mpsc::Sender<Vec<u8>>,
    state: Mutex<FlowState>,
    established: Notify,
    readable: Notify,
}

fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

impl FlowShared {
    fn valid_ack(state: &FlowState, ack: u32) -> bool {
        seq_after(ack, state.snd_una) && !seq_after(ack, state.snd_nxt)
    }

    /// Process one inbound segment. Reply segments are produced under the
    /// lock and sent after it is released.
    pub(crate) async fn handle_segment(&self, seg: &TcpInfo, payload: &[u8]) {
        let mut replies: Vec<Vec<u8>> = Vec::new();
        let mut became_established = false;
        let mut data_arrived = false;

        {
            let mut st = self.state.lock();
            st.last_activity = Instant::now();

            if seg.flags.rst {
                st.reset = true;
                st.state = TcpState::Closed;
                data_arrived = true;
                became_established = true; // wake any establishment waiter
            } else {
                match st.state {
                    TcpState::SynReceived => {
                        if seg.flags.syn && !seg.flags.ack {
                            // Retransmitted SYN: repeat the SYN-ACK.
                            replies.push(self.segment(&st, TcpFlags::syn_ack(), &[]));
                        } else if seg.flags.ack && Self::valid_ack(&st, seg.ack) {
                            st.snd_una = seg.ack;
                            st.state = TcpState::Established;
                            became_established = true;
                            debug!("flow established: {} -> {}", self.key.client, self.key.alias);
                            if !payload.is_empty() {
                                self.accept_data(&mut st, seg, payload, &mut replies, &mut data_arrived);
                            }
                        }
                    }
                    TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                        if seg.flags.ack && Self::valid_ack(&st, seg.ack) {
                            st.snd_una = seg.ack;
                            if st.state == TcpState::FinWait1 {
                                st.state = TcpState::FinWait2;
                            }
                        }
                        if !payload.is_empty() {
                            self.accept_data(&mut st, seg, payload, &mut replies, &mut data_arrived);
                        }
                        if seg.flags.fin && seg.seq.wrapping_add(payload.len() as u32) == st.rcv_nxt {
                            st.rcv_nxt = st.rcv_nxt.wrapping_add(1);
                            st.fin_seen = true;
                            data_arrived = true;
                            st.state = match st.state {
                                TcpState::Established => TcpState::CloseWait,
                                TcpState::FinWait1 => TcpState::Closing,
                                _ => TcpState::TimeWait,
                            };
                            replies.push(self.segment(&st, TcpFlags::ack_only(), &[]));
                        }
                    }
                    TcpState::CloseWait => {
                        if seg.flags.ack && Self::valid_ack(&st, seg.ack) {
                            st.snd_una = seg.ack;
                        }
                    }
                    TcpState::LastAck | TcpState::Closing => {
                        if seg.flags.ack && Self::valid_ack(&st, seg.ack) {
                            st.snd_una = seg.ack;
                            st.state = if st.state == TcpState::LastAck {
                                TcpState::Closed
                            } else {
                                TcpState::TimeWait
                            };
                        }
                    }
                    TcpState::TimeWait => {
                        if seg.flags.fin {
                            replies.push(self.segment(&st, TcpFlags::ack_only(), &[]));
                        }
                    }
                    TcpState::Closed => {}
                }
            }
        }

        for pkt in replies {
            let _ = self.outbound.send(pkt).await;
        }
        if became_established {
            self.established.notify_waiters();
        }
        if data_arrived {
            self.readable.notify_waiters();
        }
    }

    fn accept_data(
        &self,
        st: &mut FlowState,
        seg: &TcpInfo,
        payload: &[u8],
        replies: &mut Vec<Vec<u8>>,
        data_arrived: &mut bool,
    ) {
        let seq_end = seg.seq.wrapping_add(payload.len() as u32);

        if !seq_after(seq_end, st.rcv_nxt) {
            // Full retransmission, just re-ACK.
            replies.push(self.segment(st, TcpFlags::ack_only(), &[]));
            return;
        }

        if seg.seq == st.rcv_nxt {
            st.recv_buf.extend(payload);
            st.rcv_nxt = seq_end;
            *data_arrived = true;
            replies.push(self.segment(st, TcpFlags::ack_only(), &[]));
            return;
        }

        if seq_before(seg.seq, st.rcv_nxt) {
            // Partial overlap; take the new tail.
            let skip = st.rcv_nxt.wrapping_sub(seg.seq) as usize;
            if skip < payload.len() {
                st.recv_buf.extend(&payload[skip..]);
                st.rcv_nxt = seq_end;
                *data_arrived = true;
            }
            replies.push(self.segment(st, TcpFlags::ack_only(), &[]));
            return;
        }

        // Future segment: duplicate ACK forces a retransmit of the gap.
        trace!(
            "out-of-order segment seq={} expected={}, sending dup ack",
            seg.seq,
            st.rcv_nxt
        );
        replies.push(self.segment(st, TcpFlags::ack_only(), &[]));
    }

    fn segment(&self, st: &FlowState, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        let seq = if flags.syn {
            st.snd_nxt.wrapping_sub(1)
        } else {
            st.snd_nxt
        };
        let mss = if flags.syn { Some(self.mss) } else { None };
        build_tcp(
            self.key.alias,
            self.key.client,
            seq,
            st.rcv_nxt,
            flags,
            RECV_WINDOW,
            payload,
            mss,
        )
    }
}

/// Handle to one accepted inbound flow. Replies are emitted with the alias
/// tuple as their source, so the client never observes the DNAT rewrite.
pub struct TcpFlow {
    shared: Arc<FlowShared>,
    flows: Arc<dashmap::DashMap<FlowKey, Arc<FlowShared>>>,
}

impl TcpFlow {
    pub fn client(&self) -> SocketAddr {
        self.shared.key.client
    }

    pub fn alias(&self) -> SocketAddr {
        self.shared.key.alias
    }

    /// Destination after Prerouting rewriting.
    pub fn target(&self) -> SocketAddr {
        self.shared.target
    }

    /// Wait for the client's final handshake ACK.
    pub async fn wait_established(&self) -> Result<()> {
        loop {
            let notified = self.shared.established.notified();
            {
                let st = self.shared.state.lock();
                if st.reset {
                    return Err(NetstackError::FlowReset);
                }
                if st.state != TcpState::SynReceived {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Read client payload in order. Returns 0 at EOF (client FIN).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut st = self.shared.state.lock();
                if !st.recv_buf.is_empty() {
                    let n = buf.len().min(st.recv_buf.len());
                    for (i, b) in st.recv_buf.drain(..n).enumerate() {
                        buf[i] = b;
                    }
                    return Ok(n);
                }
                if st.reset {
                    return Err(NetstackError::FlowReset);
                }
                if st.fin_seen || st.state == TcpState::Closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Write data toward the client, segmented by the negotiated MSS.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mss = self.shared.mss as usize;
        for chunk in data.chunks(mss.max(1)) {
            let pkt = {
                let mut st = self.shared.state.lock();
                if st.reset || matches!(st.state, TcpState::Closed | TcpState::TimeWait) {
                    return Err(NetstackError::FlowClosed);
                }
                let pkt = self.shared.segment(&st, TcpFlags::psh_ack(), chunk);
                st.snd_nxt = st.snd_nxt.wrapping_add(chunk.len() as u32);
                pkt
            };
            self.shared
                .outbound
                .send(pkt)
                .await
                .map_err(|_| NetstackError::ChannelClosed)?;
        }
        Ok(())
    }

    /// Probe the client with a keepalive segment (seq one behind snd_nxt).
    pub async fn send_keepalive(&self) -> Result<()> {
        let pkt = {
            let st = self.shared.state.lock();
            if st.reset || st.state == TcpState::Closed {
                return Err(NetstackError::FlowClosed);
            }
            build_tcp(
                self.shared.key.alias,
                self.shared.key.client,
                st.snd_nxt.wrapping_sub(1),
                st.rcv_nxt,
                TcpFlags::ack_only(),
                RECV_WINDOW,
                &[],
                None,
            )
        };
        self.shared
            .outbound
            .send(pkt)
            .await
            .map_err(|_| NetstackError::ChannelClosed)
    }

    /// Graceful close: send FIN and move the state machine along.
    pub async fn close(&self) {
        let pkt = {
            let mut st = self.shared.state.lock();
            match st.state {
                TcpState::Established => st.state = TcpState::FinWait1,
                TcpState::CloseWait => st.state = TcpState::LastAck,
                _ => return,
            }
            let pkt = self.shared.segment(&st, TcpFlags::fin_ack(), &[]);
            st.snd_nxt = st.snd_nxt.wrapping_add(1);
            pkt
        };
        let _ = self.shared.outbound.send(pkt).await;
    }

    /// Abort: send RST and mark the flow dead.
    pub async fn reset(&self) {
        let pkt = {
            let mut st = self.shared.state.lock();
            if st.state == TcpState::Closed {
                return;
            }
            st.state = TcpState::Closed;
            st.reset = true;
            self.shared.segment(&st, TcpFlags::rst_ack(), &[])
        };
        let _ = self.shared.outbound.send(pkt).await;
        self.shared.readable.notify_waiters();
    }

    pub fn is_reset(&self) -> bool {
        self.shared.state.lock().reset
    }

    /// Time since the client was last heard from.
    pub fn idle_time(&self) -> Duration {
        self.shared.state.lock().last_activity.elapsed()
    }
}

impl Drop for TcpFlow {
    fn drop(&mut self) {
        self.flows.remove(&self.shared.key);
    }
}

/// A SYN awaiting the forwarder's decision.
pub struct TcpForwardRequest {
    pub(crate) key: FlowKey,
    pub(crate) target: SocketAddr,
    pub(crate) client_isn: u32,
    pub(crate) mss: Option<u16>,
    pub(crate) default_mss: u16,
    pub(crate) outbound: mpsc::Sender<Vec<u8>>,
    pub(crate) flows: Arc<dashmap::DashMap<FlowKey, Arc<FlowShared>>>,
    pub(crate) pending: Arc<dashmap::DashMap<FlowKey, ()>>,
}

impl TcpForwardRequest {
    /// The client side of the intercepted tuple.
    pub fn client(&self) -> SocketAddr {
        self.key.client
    }

    /// Destination as the client addressed it.
    pub fn alias(&self) -> SocketAddr {
        self.key.alias
    }

    /// Destination after Prerouting rewriting; host-reachable.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Accept the attempt: install flow state and answer the SYN.
    pub async fn accept(self) -> Result<TcpFlow> {
        let iss: u32 = rand::random();
        let mss = self.mss.unwrap_or(self.default_mss).min(self.default_mss);

        let shared = Arc::new(FlowShared {
            key: self.key,
            target: self.target,
            mss,
            outbound: self.outbound.clone(),
            state: Mutex::new(FlowState {
                state: TcpState::SynReceived,
                snd_nxt: iss.wrapping_add(1),
                snd_una: iss,
                rcv_nxt: self.client_isn.wrapping_add(1),
                recv_buf: VecDeque::new(),
                fin_seen: false,
                reset: false,
                last_activity: Instant::now(),
            }),
            established: Notify::new(),
            readable: Notify::new(),
        });

        self.flows.insert(self.key, shared.clone());
        self.pending.remove(&self.key);

        let syn_ack = {
            let st = shared.state.lock();
            shared.segment(&st, TcpFlags::syn_ack(), &[])
        };
        if self.outbound.send(syn_ack).await.is_err() {
            self.flows.remove(&self.key);
            return Err(NetstackError::ChannelClosed);
        }

        Ok(TcpFlow {
            shared,
            flows: self.flows,
        })
    }

    /// Refuse the attempt with a RST.
    pub async fn reset(self) {
        self.pending.remove(&self.key);
        let pkt = build_tcp(
            self.key.alias,
            self.key.client,
            0,
            self.client_isn.wrapping_add(1),
            TcpFlags::rst_ack(),
            0,
            &[],
            None,
        );
        let _ = self.outbound.send(pkt).await;
    }
}

/// Transport-protocol handler the stack invokes for each new inbound SYN.
#[async_trait]
pub trait TcpHandler: Send + Sync {
    async fn handle(&self, request: TcpForwardRequest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{parse_packet, TransportInfo};

    fn request(
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> (
        TcpForwardRequest,
        Arc<dashmap::DashMap<FlowKey, Arc<FlowShared>>>,
    ) {
        let flows = Arc::new(dashmap::DashMap::new());
        let pending = Arc::new(dashmap::DashMap::new());
        let key = FlowKey {
            client: "192.168.0.1:4000".parse().unwrap(),
            alias: "10.9.8.1:80".parse().unwrap(),
        };
        pending.insert(key, ());
        (
            TcpForwardRequest {
                key,
                target: "93.184.216.34:80".parse().unwrap(),
                client_isn: 5000,
                mss: Some(1400),
                default_mss: 1380,
                outbound,
                flows: flows.clone(),
                pending,
            },
            flows,
        )
    }

    fn tcp_info(pkt: &[u8]) -> TcpInfo {
        match parse_packet(pkt).unwrap().transport {
            TransportInfo::Tcp(t) => t,
            other => panic!("expected tcp, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accept_sends_syn_ack_from_alias() {
        let (tx, mut rx) = mpsc::channel(16);
        let (req, _flows) = request(tx);
        let flow = req.accept().await.unwrap();

        let syn_ack = rx.recv().await.unwrap();
        let parsed = parse_packet(&syn_ack).unwrap();
        assert_eq!(parsed.src_socket().unwrap(), flow.alias());
        assert_eq!(parsed.dst_socket().unwrap(), flow.client());
        let t = tcp_info(&syn_ack);
        assert!(t.flags.syn && t.flags.ack);
        assert_eq!(t.ack, 5001);
        // MSS capped at the stack's own value.
        assert_eq!(t.mss, Some(1380));
    }

    #[tokio::test]
    async fn handshake_then_data_read_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let (req, flows) = request(tx);
        let flow = req.accept().await.unwrap();
        let syn_ack = tcp_info(&rx.recv().await.unwrap());
        let shared = flows.iter().next().unwrap().value().clone();

        // Client completes the handshake.
        let ack = TcpInfo {
            src_port: 4000,
            dst_port: 80,
            seq: 5001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::ack_only(),
            window: 65535,
            mss: None,
            header_len: 20,
        };
        shared.handle_segment(&ack, &[]).await;
        flow.wait_established().await.unwrap();

        // In-order payload is readable; a duplicate is only re-ACKed.
        let mut data = ack.clone();
        data.flags = TcpFlags::psh_ack();
        shared.handle_segment(&data, b"hello").await;
        shared.handle_segment(&data, b"hello").await;

        let mut buf = [0u8; 16];
        let n = flow.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Both segments were ACKed with the same rcv_nxt.
        let ack1 = tcp_info(&rx.recv().await.unwrap());
        let ack2 = tcp_info(&rx.recv().await.unwrap());
        assert_eq!(ack1.ack, 5001 + 5);
        assert_eq!(ack2.ack, 5001 + 5);
    }

    #[tokio::test]
    async fn reset_request_emits_rst() {
        let (tx, mut rx) = mpsc::channel(16);
        let (req, _flows) = request(tx);
        req.reset().await;
        let t = tcp_info(&rx.recv().await.unwrap());
        assert!(t.flags.rst);
        assert_eq!(t.ack, 5001);
    }

    #[tokio::test]
    async fn fin_yields_eof_after_drain() {
        let (tx, mut rx) = mpsc::channel(16);
        let (req, flows) = request(tx);
        let flow = req.accept().await.unwrap();
        let syn_ack = tcp_info(&rx.recv().await.unwrap());
        let shared = flows.iter().next().unwrap().value().clone();

        let base = TcpInfo {
            src_port: 4000,
            dst_port: 80,
            seq: 5001,
            ack: syn_ack.seq.wrapping_add(1),
            flags: TcpFlags::ack_only(),
            window: 65535,
            mss: None,
            header_len: 20,
        };
        shared.handle_segment(&base, &[]).await;

        let mut data = base.clone();
        data.flags = TcpFlags::psh_ack();
        shared.handle_segment(&data, b"bye").await;

        let mut fin = base.clone();
        fin.seq = 5004;
        fin.flags = TcpFlags::fin_ack();
        shared.handle_segment(&fin, &[]).await;

        let mut buf = [0u8; 8];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 3);
        assert_eq!(flow.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flow_drop_removes_map_entry() {
        let (tx, mut _rx) = mpsc::channel(16);
        let (req, flows) = request(tx);
        let flow = req.accept().await.unwrap();
        assert_eq!(flows.len(), 1);
        drop(flow);
        assert_eq!(flows.len(), 0);
    }
}
