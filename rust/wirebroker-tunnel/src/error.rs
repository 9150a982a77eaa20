//! Error types for the tunnel device

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("IPC parse error on line {line}: {message}")]
    IpcParse { line: usize, message: String },

    #[error("Device not configured: {0}")]
    NotConfigured(String),

    #[error("WireGuard error: {0}")]
    Noise(String),

    #[error("Device already up")]
    AlreadyUp,
}
