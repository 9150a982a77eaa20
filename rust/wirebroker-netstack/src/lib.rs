//! Wirebroker netstack - sandboxed userspace TCP/IP stack
//!
//! A small dual-stack IP layer with the pieces the broker needs: a TUN-like
//! packet queue pair per stack, a netfilter-style NAT table with pluggable
//! matchers and targets, transport-protocol handler registration for TCP and
//! UDP, userspace datagram sockets (so a nested tunnel can bind "UDP" without
//! touching the host), and an ICMP echo intake.
//!
//! ```text
//! tunnel device ──inject──▶ Prerouting ──▶ local? ──▶ sockets / handlers
//!                                   │                      │
//!                                   └─▶ Forward ─▶ Postrouting ─▶ outbound
//! ```
//!
//! The stack never opens host sockets; the supervisor wires its queues to a
//! tunnel device and its handlers to the forwarders.

pub mod error;
pub mod packet;
pub mod rules;
pub mod stack;
pub mod tcp;
pub mod udp;

pub use error::{NetstackError, Result};
pub use packet::{parse_packet, ParsedPacket, TcpFlags, TcpInfo, TransportInfo, UdpInfo};
pub use rules::{Hook, IpHeaderFilter, Rule, RuleMatcher, RuleTable, RuleTarget, Verdict, NUM_HOOKS};
pub use stack::{EchoRequest, Stack, IPV4_OVERHEAD, IPV6_OVERHEAD};
pub use tcp::{FlowKey, TcpFlow, TcpForwardRequest, TcpHandler, RECV_WINDOW};
pub use udp::{UdpDatagram, UdpHandler, UdpSocket};

pub use smoltcp::wire::{IpProtocol, IpVersion};

#[cfg(test)]
mod tests {
    mod property_tests;
}
