//! L4 forwarders attached to the transport handler stack
//!
//! Both forwarders terminate the client's flow on the virtual stack and open
//! a matching flow on the host, then splice. Per-flow failures reset or drop
//! that flow only.

pub mod tcp;
pub mod udp;

pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;
