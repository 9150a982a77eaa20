//! Userspace UDP sockets and the UDP transport handler surface
//!
//! Datagrams to a bound port are queued on the owning [`UdpSocket`]; anything
//! else is offered to the registered transport handler (the forwarder).

use crate::error::{NetstackError, Result};
use crate::packet::build_udp;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

const SOCKET_QUEUE_DEPTH: usize = 256;

/// One datagram handed to the transport handler, carrying the destination
/// both as the client addressed it and after Prerouting rewriting.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src: SocketAddr,
    pub alias_dst: SocketAddr,
    pub target: SocketAddr,
    pub payload: Bytes,
}

/// Transport-protocol handler invoked for datagrams no socket claims.
#[async_trait]
pub trait UdpHandler: Send + Sync {
    async fn handle(&self, datagram: UdpDatagram);
}

pub(crate) struct UdpBinding {
    addr: IpAddr,
    tx: mpsc::Sender<(SocketAddr, Bytes)>,
}

/// Port-keyed bind table. An unspecified bind address claims the port on
/// every interface address.
#[derive(Default)]
pub(crate) struct UdpBindTable {
    bindings: DashMap<u16, UdpBinding>,
}

impl UdpBindTable {
    pub(crate) fn bind(
        &self,
        local: SocketAddr,
    ) -> Result<mpsc::Receiver<(SocketAddr, Bytes)>> {
        if self.bindings.contains_key(&local.port()) {
            return Err(NetstackError::AddressInUse(local));
        }
        let (tx, rx) = mpsc::channel(SOCKET_QUEUE_DEPTH);
        self.bindings.insert(
            local.port(),
            UdpBinding { addr: local.ip(), tx },
        );
        Ok(rx)
    }

    pub(crate) fn unbind(&self, port: u16) {
        self.bindings.remove(&port);
    }

    /// Queue a datagram on a matching socket. Returns false when no socket
    /// claims the destination.
    pub(crate) fn deliver(&self, src: SocketAddr, dst: SocketAddr, payload: Bytes) -> bool {
        let Some(binding) = self.bindings.get(&dst.port()) else {
            return false;
        };
        if !binding.addr.is_unspecified() && binding.addr != dst.ip() {
            return false;
        }
        if binding.tx.try_send((src, payload)).is_err() {
            trace!("udp socket queue full, dropping datagram for {}", dst);
        }
        true
    }
}

/// A datagram socket living on the virtual stack. This is the socket the
/// nested tunnel binds instead of a host socket.
pub struct UdpSocket {
    local: SocketAddr,
    rx: Mutex<mpsc::Receiver<(SocketAddr, Bytes)>>,
    outbound: mpsc::Sender<Vec<u8>>,
    table: Arc<UdpBindTable>,
    /// Interface addresses, shared with the stack; used to pick a concrete
    /// source for sockets bound to the unspecified address.
    iface_addrs: Arc<parking_lot::RwLock<Vec<IpAddr>>>,
    mtu: usize,
}

impl UdpSocket {
    pub(crate) fn new(
        local: SocketAddr,
        rx: mpsc::Receiver<(SocketAddr, Bytes)>,
        outbound: mpsc::Sender<Vec<u8>>,
        table: Arc<UdpBindTable>,
        iface_addrs: Arc<parking_lot::RwLock<Vec<IpAddr>>>,
        mtu: usize,
    ) -> Self {
        Self {
            local,
            rx: Mutex::new(rx),
            outbound,
            table,
            iface_addrs,
            mtu,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn source_for(&self, peer: SocketAddr) -> SocketAddr {
        if !self.local.ip().is_unspecified() {
            return self.local;
        }
        let addrs = self.iface_addrs.read();
        let addr = addrs
            .iter()
            .find(|a| a.is_ipv4() == peer.is_ipv4())
            .copied()
            .unwrap_or(self.local.ip());
        SocketAddr::new(addr, self.local.port())
    }

    pub async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> Result<()> {
        let room = self.mtu - if peer.is_ipv4() { 28 } else { 48 };
        if payload.len() > room {
            return Err(NetstackError::Unsupported(format!(
                "datagram of {} bytes does not fit the interface mtu ({} available)",
                payload.len(),
                room
            )));
        }
        let pkt = build_udp(self.source_for(peer), peer, payload);
        if pkt.is_empty() {
            return Err(NetstackError::Unsupported(
                "address family mismatch between socket and peer".into(),
            ));
        }
        self.outbound
            .send(pkt)
            .await
            .map_err(|_| NetstackError::ChannelClosed)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        let (peer, payload) = rx.recv().await.ok_or(NetstackError::ChannelClosed)?;
        let n = buf.len().min(payload.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, peer))
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.table.unbind(self.local.port());
    }
}
