//! UDP forwarder
//!
//! Flows are discovered on demand: the first datagram for a
//! `(client, alias)` pair opens an ephemeral host socket connected to the
//! rewritten destination and spawns a copy task per direction. An idle
//! watchdog tears the pair down; there is no flow table kept across
//! restarts.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use wirebroker_netstack::{Stack, UdpDatagram, UdpHandler};

/// Flows end after a minute without traffic in either direction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const FLOW_QUEUE_DEPTH: usize = 256;
const WATCHDOG_TICK: Duration = Duration::from_secs(5);

type FlowKey = (SocketAddr, SocketAddr);

struct UdpFlow {
    to_host: mpsc::Sender<Bytes>,
    last_activity: Arc<Mutex<Instant>>,
}

pub struct UdpForwarder {
    stack: Stack,
    flows: Arc<DashMap<FlowKey, UdpFlow>>,
    idle_timeout: Duration,
}

impl UdpForwarder {
    pub fn new(stack: Stack) -> Self {
        Self::with_idle_timeout(stack, IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(stack: Stack, idle_timeout: Duration) -> Self {
        Self {
            stack,
            flows: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    async fn open_flow(&self, datagram: UdpDatagram) {
        let key = (datagram.src, datagram.alias_dst);
        let (to_host, mut host_rx) = mpsc::channel::<Bytes>(FLOW_QUEUE_DEPTH);
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        // Reserve the slot before any I/O; a concurrent datagram for the
        // same pair queues on the winner instead of opening a second flow.
        match self.flows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let _ = existing.get().to_host.try_send(datagram.payload.clone());
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(UdpFlow {
                    to_host: to_host.clone(),
                    last_activity: last_activity.clone(),
                });
            }
        }

        let bind_addr: SocketAddr = if datagram.target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(err) => {
                debug!("udp bind for {} failed: {}", datagram.target, err);
                self.flows.remove(&key);
                return;
            }
        };
        if let Err(err) = socket.connect(datagram.target).await {
            debug!("udp connect {} failed: {}", datagram.target, err);
            self.flows.remove(&key);
            return;
        }
        let socket = Arc::new(socket);

        if let Err(err) = to_host.try_send(datagram.payload.clone()) {
            trace!("first datagram dropped: {}", err);
        }
        trace!(
            "udp flow opened: {} -> {} (target {})",
            datagram.src,
            datagram.alias_dst,
            datagram.target
        );

        // Virtual -> host.
        let outbound = {
            let socket = socket.clone();
            let last_activity = last_activity.clone();
            tokio::spawn(async move {
                while let Some(payload) = host_rx.recv().await {
                    if socket.send(&payload).await.is_err() {
                        break;
                    }
                    *last_activity.lock() = Instant::now();
                }
            })
        };

        // Host -> virtual, replies under the alias source.
        let inbound = {
            let socket = socket.clone();
            let stack = self.stack.clone();
            let last_activity = last_activity.clone();
            let alias = datagram.alias_dst;
            let client = datagram.src;
            let mtu = self.stack.mtu();
            tokio::spawn(async move {
                let mut buf = vec![0u8; mtu];
                loop {
                    match socket.recv(&mut buf).await {
                        Ok(n) => {
                            *last_activity.lock() = Instant::now();
                            if stack.send_udp(alias, client, &buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            trace!("udp recv from host failed: {}", err);
                            break;
                        }
                    }
                }
            })
        };

        // Watchdog: kill both copy tasks once the flow has idled out.
        let flows = self.flows.clone();
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_TICK.min(idle_timeout)).await;
                let idle_for = last_activity.lock().elapsed();
                if idle_for >= idle_timeout {
                    break;
                }
            }
            outbound.abort();
            inbound.abort();
            flows.remove(&key);
            trace!("udp flow idled out: {:?}", key);
        });
    }
}

#[async_trait]
impl UdpHandler for UdpForwarder {
    async fn handle(&self, datagram: UdpDatagram) {
        let key = (datagram.src, datagram.alias_dst);
        if let Some(flow) = self.flows.get(&key) {
            *flow.last_activity.lock() = Instant::now();
            if flow.to_host.try_send(datagram.payload.clone()).is_ok() {
                return;
            }
            trace!("udp flow queue full: {:?}", key);
            return;
        }
        self.open_flow(datagram).await;
    }
}
