//! Datagram transports for the tunnel device
//!
//! The outer tunnel binds a real host socket; the nested tunnel binds a
//! userspace socket on the outer tunnel's stack. The device only sees this
//! trait, which is what makes the nesting composable.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<()>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_port(&self) -> u16;
}

/// Host UDP socket, dual-stack.
pub struct HostTransport {
    socket: UdpSocket,
    port: u16,
}

impl HostTransport {
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(false)?;
        socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port).into())?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let port = socket.local_addr()?.port();
        Ok(Self { socket, port })
    }
}

#[async_trait]
impl DatagramTransport for HostTransport {
    async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<()> {
        // A dual-stack v6 socket wants v4 peers in mapped form.
        let peer = match peer {
            SocketAddr::V4(v4) => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            other => other,
        };
        self.socket.send_to(payload, peer).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, peer) = self.socket.recv_from(buf).await?;
        let peer = match peer.ip() {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), peer.port()),
                None => peer,
            },
            _ => peer,
        };
        Ok((n, peer))
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Userspace UDP socket on another tunnel's stack. This is what carries the
/// nested tunnel's datagrams inside the outer tunnel's encrypted stream.
pub struct NetstackTransport {
    socket: wirebroker_netstack::UdpSocket,
}

impl NetstackTransport {
    pub fn new(socket: wirebroker_netstack::UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl DatagramTransport for NetstackTransport {
    async fn send_to(&self, payload: &[u8], peer: SocketAddr) -> io::Result<()> {
        self.socket
            .send_to(payload, peer)
            .await
            .map_err(io::Error::other)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await.map_err(io::Error::other)
    }

    fn local_port(&self) -> u16 {
        self.socket.local_addr().port()
    }
}
