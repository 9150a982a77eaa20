//! Tunnel configuration and its two textual forms
//!
//! The IPC form is the line-oriented `key=value` format the wireguard
//! userspace tools speak (hex keys); the shareable form is a wg-quick style
//! file with base64 keys for the operator to hand to the remote side.

use crate::error::{Result, TunnelError};
use crate::keys;
use cidr::IpCidr;
use std::fmt::Write as _;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpCidr>,
    /// Seconds between keepalives; 0 disables them. Only meaningful with an
    /// endpoint to send them to.
    pub persistent_keepalive: u16,
}

impl PeerConfig {
    pub fn new(public_key: [u8; 32]) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            persistent_keepalive: 0,
        }
    }

    /// Keepalive interval actually in effect: silenced without an endpoint.
    pub fn effective_keepalive(&self) -> u16 {
        if self.endpoint.is_some() {
            self.persistent_keepalive
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub private_key: [u8; 32],
    pub listen_port: Option<u16>,
    /// Local interface addresses with prefixes.
    pub addresses: Vec<IpCidr>,
    pub mtu: usize,
    pub peers: Vec<PeerConfig>,
}

impl TunnelConfig {
    pub fn public_key(&self) -> [u8; 32] {
        keys::public_from_private(&self.private_key)
    }

    /// Render in the wireguard IPC set format.
    pub fn to_ipc(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "private_key={}", keys::encode_hex(&self.private_key));
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "listen_port={}", port);
        }
        let _ = writeln!(out, "replace_peers=true");
        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", keys::encode_hex(&peer.public_key));
            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "preshared_key={}", keys::encode_hex(psk));
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={}", endpoint);
            }
            let keepalive = peer.effective_keepalive();
            if keepalive != 0 {
                let _ = writeln!(out, "persistent_keepalive_interval={}", keepalive);
            }
            let _ = writeln!(out, "replace_allowed_ips=true");
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={}", net);
            }
        }
        out
    }

    /// Parse the IPC set format. Addresses and MTU are not part of the IPC
    /// surface and come back empty.
    pub fn from_ipc(text: &str) -> Result<Self> {
        let mut private_key = None;
        let mut listen_port = None;
        let mut peers: Vec<PeerConfig> = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(TunnelError::IpcParse {
                line: idx + 1,
                message: "expected key=value".into(),
            })?;
            let parse_err = |message: String| TunnelError::IpcParse { line: idx + 1, message };

            match key {
                "private_key" => private_key = Some(keys::decode_hex(value)?),
                "listen_port" => {
                    listen_port = Some(value.parse().map_err(|_| parse_err(format!("bad port {value:?}")))?)
                }
                "replace_peers" | "replace_allowed_ips" => {}
                "public_key" => peers.push(PeerConfig::new(keys::decode_hex(value)?)),
                "preshared_key" => {
                    let peer = peers.last_mut().ok_or_else(|| parse_err("preshared_key before public_key".into()))?;
                    peer.preshared_key = Some(keys::decode_hex(value)?);
                }
                "endpoint" => {
                    let peer = peers.last_mut().ok_or_else(|| parse_err("endpoint before public_key".into()))?;
                    peer.endpoint = Some(value.parse().map_err(|_| parse_err(format!("bad endpoint {value:?}")))?);
                }
                "persistent_keepalive_interval" => {
                    let peer = peers.last_mut().ok_or_else(|| parse_err("keepalive before public_key".into()))?;
                    peer.persistent_keepalive =
                        value.parse().map_err(|_| parse_err(format!("bad keepalive {value:?}")))?;
                }
                "allowed_ip" => {
                    let peer = peers.last_mut().ok_or_else(|| parse_err("allowed_ip before public_key".into()))?;
                    peer.allowed_ips.push(
                        value.parse().map_err(|_| parse_err(format!("bad prefix {value:?}")))?,
                    );
                }
                other => return Err(parse_err(format!("unknown key {other:?}"))),
            }
        }

        Ok(Self {
            private_key: private_key
                .ok_or_else(|| TunnelError::NotConfigured("private_key missing from ipc text".into()))?,
            listen_port,
            addresses: Vec::new(),
            mtu: 0,
            peers,
        })
    }

    /// Render in wg-quick style for the operator, base64 keys. The derived
    /// public key rides along as a comment so the remote side can be
    /// configured without another tool.
    pub fn to_shareable(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Interface]");
        let _ = writeln!(out, "PrivateKey = {}", keys::encode_base64(&self.private_key));
        let _ = writeln!(out, "# PublicKey = {}", keys::encode_base64(&self.public_key()));
        if !self.addresses.is_empty() {
            let addrs: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
            let _ = writeln!(out, "Address = {}", addrs.join(", "));
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        if self.mtu != 0 {
            let _ = writeln!(out, "MTU = {}", self.mtu);
        }
        for peer in &self.peers {
            let _ = writeln!(out);
            let _ = writeln!(out, "[Peer]");
            let _ = writeln!(out, "PublicKey = {}", keys::encode_base64(&peer.public_key));
            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "PresharedKey = {}", keys::encode_base64(psk));
            }
            if !peer.allowed_ips.is_empty() {
                let nets: Vec<String> = peer.allowed_ips.iter().map(|a| a.to_string()).collect();
                let _ = writeln!(out, "AllowedIPs = {}", nets.join(", "));
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            let keepalive = peer.effective_keepalive();
            if keepalive != 0 {
                let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TunnelConfig {
        let (private, _) = keys::generate_keypair();
        let (_, peer_public) = keys::generate_keypair();
        let mut peer = PeerConfig::new(peer_public);
        peer.endpoint = Some("203.0.113.9:51820".parse().unwrap());
        peer.persistent_keepalive = 25;
        peer.allowed_ips = vec!["192.168.0.1/32".parse().unwrap(), "fd:face::1/128".parse().unwrap()];

        TunnelConfig {
            private_key: private,
            listen_port: Some(51820),
            addresses: vec!["192.168.0.2/32".parse().unwrap()],
            mtu: 1420,
            peers: vec![peer],
        }
    }

    #[test]
    fn ipc_round_trip_is_byte_stable() {
        let config = sample();
        let ipc = config.to_ipc();
        let parsed = TunnelConfig::from_ipc(&ipc).unwrap();
        assert_eq!(parsed.to_ipc(), ipc);
        assert_eq!(parsed.private_key, config.private_key);
        assert_eq!(parsed.listen_port, config.listen_port);
        assert_eq!(parsed.peers, config.peers);
    }

    #[test]
    fn keepalive_omitted_without_endpoint() {
        let mut config = sample();
        config.peers[0].endpoint = None;
        let ipc = config.to_ipc();
        assert!(!ipc.contains("persistent_keepalive_interval"));
        assert!(!ipc.contains("endpoint="));
    }

    #[test]
    fn shareable_uses_base64() {
        let config = sample();
        let text = config.to_shareable();
        assert!(text.starts_with("[Interface]"));
        assert!(text.contains(&keys::encode_base64(&config.private_key)));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(!text.contains(&keys::encode_hex(&config.private_key)));
    }

    #[test]
    fn unknown_ipc_key_rejected() {
        let err = TunnelConfig::from_ipc("fwmark=1\n").unwrap_err();
        assert!(matches!(err, TunnelError::IpcParse { line: 1, .. }));
    }
}
