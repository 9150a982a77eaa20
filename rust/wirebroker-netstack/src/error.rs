//! Error types for the wirebroker netstack

use std::io;
use thiserror::Error;

/// Result type alias for netstack operations
pub type Result<T> = std::result::Result<T, NetstackError>;

/// Main error type for the userspace stack
#[derive(Error, Debug)]
pub enum NetstackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Address {0} already bound")]
    AddressInUse(std::net::SocketAddr),

    #[error("Flow closed")]
    FlowClosed,

    #[error("Flow reset by peer")]
    FlowReset,

    #[error("Handshake did not complete in time")]
    HandshakeTimeout,

    #[error("Packet queue closed")]
    ChannelClosed,

    #[error("Rule table rejected: {0}")]
    TableRejected(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}
