//! Broker error types
//!
//! Startup errors (configuration, initial construction, table install) are
//! fatal and propagate to `main`; steady-state errors stay confined to the
//! flow or alias slot they belong to and are only logged.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("DNS resolution failed for {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] wirebroker_tunnel::TunnelError),

    #[error("Stack error: {0}")]
    Stack(#[from] wirebroker_netstack::NetstackError),

    #[error("Forwarder error: {0}")]
    Forward(String),

    #[error("Gateway request failed: {0}")]
    Gateway(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}
