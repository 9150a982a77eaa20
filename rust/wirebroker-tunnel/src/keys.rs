//! Curve25519 key material helpers
//!
//! Keys travel base64-encoded in operator-facing renderings and hex-encoded
//! on the IPC surface, matching the wireguard userspace convention.

use crate::error::{Result, TunnelError};
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use boringtun::x25519::{PublicKey, StaticSecret};
use rand::rngs::OsRng;

pub const KEY_LEN: usize = 32;

/// Generate a fresh private/public keypair.
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key for a private key.
pub fn public_from_private(private: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private);
    PublicKey::from(&secret).to_bytes()
}

pub fn encode_base64(key: &[u8; KEY_LEN]) -> String {
    BASE64_STD.encode(key)
}

pub fn decode_base64(text: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64_STD
        .decode(text.trim())
        .map_err(|e| TunnelError::InvalidKey(format!("bad base64: {}", e)))?;
    to_key(&bytes)
}

pub fn encode_hex(key: &[u8; KEY_LEN]) -> String {
    hex::encode(key)
}

pub fn decode_hex(text: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(text.trim())
        .map_err(|e| TunnelError::InvalidKey(format!("bad hex: {}", e)))?;
    to_key(&bytes)
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    bytes
        .try_into()
        .map_err(|_| TunnelError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len())))
}
