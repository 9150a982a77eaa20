//! Wirebroker tunnel - WireGuard device over pluggable transports
//!
//! The Noise handshake, transport crypto, rekey and replay protection all
//! live in boringtun; this crate owns the plumbing around it: per-peer
//! `Tunn` state, the rx/tx/timer workers, the IPC text surface, and the
//! [`transport::DatagramTransport`] seam that lets the same device run over
//! a host UDP socket (relay tunnel) or a userspace socket on another
//! tunnel's stack (nested end-to-end tunnel).

pub mod config;
pub mod device;
pub mod error;
pub mod keys;
pub mod transport;

pub use config::{PeerConfig, TunnelConfig};
pub use device::Device;
pub use error::{Result, TunnelError};
pub use transport::{DatagramTransport, HostTransport, NetstackTransport};
