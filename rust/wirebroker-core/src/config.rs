//! Broker configuration
//!
//! One immutable [`BrokerConfig`] is built at startup from defaults, an
//! optional INI file and `WIREBROKER_`-prefixed environment overrides, then
//! passed by reference to every component. Nothing reads configuration after
//! startup.
//!
//! INI keys mirror the sections the broker has always shipped with:
//!
//! ```ini
//! [Relay.Interface]
//! PrivateKey = <base64>
//! Port = 51820
//!
//! [Relay.Peer]
//! PublicKey = <base64>
//!
//! [Mapping]
//! Hosts = a.example:80:443, b.example
//! Prefix = 10.9.8
//!
//! [Gateway]
//! Domain = gateway.example.com
//! Token = <bearer>
//! ```

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

/// Build-time synthetic addressing defaults.
pub mod defaults {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    pub const RELAY_PORT: u16 = 51820;
    /// Port the nested tunnel listens on, inside the relay's stack.
    pub const E2EE_PORT: u16 = 51821;
    pub const MTU: usize = 1420;
    /// Overhead of nesting one tunnel inside another: 32 bytes of wireguard
    /// framing plus an IPv6+UDP header.
    pub const E2EE_MTU_OVERHEAD: usize = 80;
    pub const KEEPALIVE: u16 = 25;

    pub const SERVER_RELAY_V4: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);
    pub const CLIENT_RELAY_V4: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
    pub const SERVER_RELAY_V6: Ipv6Addr = Ipv6Addr::new(0xfd, 0xface, 0, 0, 0, 0, 0, 2);
    pub const CLIENT_RELAY_V6: Ipv6Addr = Ipv6Addr::new(0xfd, 0xface, 0, 0, 0, 0, 0, 1);

    pub const SERVER_E2EE_V4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
    pub const CLIENT_E2EE_V4: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    pub const SERVER_E2EE_V6: Ipv6Addr = Ipv6Addr::new(0xfd, 0xe2ee, 0, 0, 0, 0, 0, 2);
    pub const CLIENT_E2EE_V6: Ipv6Addr = Ipv6Addr::new(0xfd, 0xe2ee, 0, 0, 0, 0, 0, 1);

    /// First reachable address of the API subnet, added to the transport
    /// handler stack.
    pub const API_ADDR: IpAddr = IpAddr::V6(Ipv6Addr::new(0xfd, 0xa191, 0, 0, 0, 0, 0, 2));
    /// IPv4 fallback when IPv6 is disabled.
    pub const API_ADDR_V4: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 255, 255, 2));

    pub const HEALTH_PORT: u16 = 8080;

    pub const CATCH_TIMEOUT_MS: u64 = 5000;
    pub const CONN_TIMEOUT_MS: u64 = 5000;
    pub const KEEPALIVE_IDLE_SECS: u64 = 60;
    pub const KEEPALIVE_INTERVAL_SECS: u64 = 60;
    pub const KEEPALIVE_COUNT: u32 = 3;
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub quiet: bool,
    pub verbose: bool,
    pub file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Base64 public key of the remote side.
    pub public_key: Option<String>,
    /// `host:port`; names are resolved at startup.
    pub endpoint: Option<String>,
    /// Comma-separated allowed prefixes.
    pub allowed: Vec<String>,
    pub keepalive: u16,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub private_key: Option<String>,
    pub port: u16,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub mtu: usize,
    pub peer: PeerEntry,
}

#[derive(Debug, Clone)]
pub struct E2eeConfig {
    pub private_key: Option<String>,
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub api: IpAddr,
    pub peer: PeerEntry,
}

#[derive(Debug, Clone)]
pub struct ClientAddrs {
    pub relay_v4: Ipv4Addr,
    pub relay_v6: Ipv6Addr,
    pub e2ee_v4: Ipv4Addr,
    pub e2ee_v6: Ipv6Addr,
}

#[derive(Debug, Clone, Default)]
pub struct MappingConfig {
    /// `host[:port[:port...]]` comma list.
    pub hosts: String,
    /// IPv4 /24 host-zero prefix, with or without a trailing dot
    /// (`10.9.8` or `10.9.8.`).
    pub prefix: String,
}

impl MappingConfig {
    pub fn enabled(&self) -> bool {
        !self.prefix.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub domain: Option<String>,
    pub token: String,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Deadline for the client to finish the inbound three-way handshake.
    pub catch_timeout_ms: u64,
    /// Deadline for the outbound host dial.
    pub conn_timeout_ms: u64,
    pub keepalive_idle_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_count: u32,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            catch_timeout_ms: defaults::CATCH_TIMEOUT_MS,
            conn_timeout_ms: defaults::CONN_TIMEOUT_MS,
            keepalive_idle_secs: defaults::KEEPALIVE_IDLE_SECS,
            keepalive_interval_secs: defaults::KEEPALIVE_INTERVAL_SECS,
            keepalive_count: defaults::KEEPALIVE_COUNT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Single-tunnel mode: no nested tunnel, forwarders on the relay stack.
    pub simple: bool,
    pub disable_ipv6: bool,
    pub relay: RelayConfig,
    pub e2ee: E2eeConfig,
    pub client: ClientAddrs,
    pub mapping: MappingConfig,
    pub gateway: GatewayConfig,
    pub forward: ForwardConfig,
    pub health_addr: SocketAddr,
    pub log: LogConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            simple: true,
            disable_ipv6: false,
            relay: RelayConfig {
                private_key: None,
                port: defaults::RELAY_PORT,
                ipv4: defaults::SERVER_RELAY_V4,
                ipv6: defaults::SERVER_RELAY_V6,
                mtu: defaults::MTU,
                peer: PeerEntry {
                    public_key: None,
                    endpoint: None,
                    allowed: vec![
                        format!("{}/32", defaults::CLIENT_RELAY_V4),
                        format!("{}/128", defaults::CLIENT_RELAY_V6),
                    ],
                    keepalive: defaults::KEEPALIVE,
                },
            },
            e2ee: E2eeConfig {
                private_key: None,
                ipv4: defaults::SERVER_E2EE_V4,
                ipv6: defaults::SERVER_E2EE_V6,
                api: defaults::API_ADDR,
                peer: PeerEntry {
                    public_key: None,
                    endpoint: None,
                    allowed: vec![
                        format!("{}/32", defaults::CLIENT_E2EE_V4),
                        format!("{}/128", defaults::CLIENT_E2EE_V6),
                    ],
                    keepalive: defaults::KEEPALIVE,
                },
            },
            client: ClientAddrs {
                relay_v4: defaults::CLIENT_RELAY_V4,
                relay_v6: defaults::CLIENT_RELAY_V6,
                e2ee_v4: defaults::CLIENT_E2EE_V4,
                e2ee_v6: defaults::CLIENT_E2EE_V6,
            },
            mapping: MappingConfig::default(),
            gateway: GatewayConfig::default(),
            forward: ForwardConfig::default(),
            health_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                defaults::HEALTH_PORT,
            ),
            log: LogConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Load defaults, then the INI file (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut values = HashMap::new();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
            parse_ini(&text, &mut values)?;
        }
        apply_env(&mut values);

        let mut config = Self::default();
        config.apply(&values)?;
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, values: &HashMap<String, String>) -> Result<()> {
        for (key, value) in values {
            self.apply_one(key, value)?;
        }
        Ok(())
    }

    fn apply_one(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_err = |what: &str| Error::config(format!("invalid {} value {:?}", what, value));
        match key {
            "simple" => self.simple = parse_bool(value).ok_or_else(|| parse_err(key))?,
            "disableipv6" => self.disable_ipv6 = parse_bool(value).ok_or_else(|| parse_err(key))?,

            "relay.interface.privatekey" => self.relay.private_key = Some(value.to_string()),
            "relay.interface.port" => self.relay.port = value.parse().map_err(|_| parse_err(key))?,
            "relay.interface.ipv4" => self.relay.ipv4 = value.parse().map_err(|_| parse_err(key))?,
            "relay.interface.ipv6" => self.relay.ipv6 = value.parse().map_err(|_| parse_err(key))?,
            "relay.interface.mtu" => self.relay.mtu = value.parse().map_err(|_| parse_err(key))?,
            "relay.peer.publickey" => self.relay.peer.public_key = Some(value.to_string()),
            "relay.peer.endpoint" => self.relay.peer.endpoint = Some(value.to_string()),
            "relay.peer.allowed" => {
                self.relay.peer.allowed =
                    value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            }
            "relay.peer.keepalive" => {
                self.relay.peer.keepalive = value.parse().map_err(|_| parse_err(key))?
            }

            "e2ee.interface.privatekey" => self.e2ee.private_key = Some(value.to_string()),
            "e2ee.interface.ipv4" => self.e2ee.ipv4 = value.parse().map_err(|_| parse_err(key))?,
            "e2ee.interface.ipv6" => self.e2ee.ipv6 = value.parse().map_err(|_| parse_err(key))?,
            "e2ee.interface.api" => self.e2ee.api = value.parse().map_err(|_| parse_err(key))?,
            "e2ee.peer.publickey" => self.e2ee.peer.public_key = Some(value.to_string()),
            "e2ee.peer.endpoint" => self.e2ee.peer.endpoint = Some(value.to_string()),
            "e2ee.peer.allowed" => {
                self.e2ee.peer.allowed =
                    value.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            }
            "e2ee.peer.keepalive" => {
                self.e2ee.peer.keepalive = value.parse().map_err(|_| parse_err(key))?
            }

            "client.relay.ipv4" => self.client.relay_v4 = value.parse().map_err(|_| parse_err(key))?,
            "client.relay.ipv6" => self.client.relay_v6 = value.parse().map_err(|_| parse_err(key))?,
            "client.e2ee.ipv4" => self.client.e2ee_v4 = value.parse().map_err(|_| parse_err(key))?,
            "client.e2ee.ipv6" => self.client.e2ee_v6 = value.parse().map_err(|_| parse_err(key))?,

            "mapping.hosts" => self.mapping.hosts = value.to_string(),
            "mapping.prefix" => self.mapping.prefix = value.to_string(),

            "gateway.domain" => self.gateway.domain = Some(value.to_string()),
            "gateway.token" => self.gateway.token = value.to_string(),
            "gateway.skipsslverify" => {
                self.gateway.skip_tls_verify = parse_bool(value).ok_or_else(|| parse_err(key))?
            }

            "forward.catchtimeout" => {
                self.forward.catch_timeout_ms = value.parse().map_err(|_| parse_err(key))?
            }
            "forward.conntimeout" => {
                self.forward.conn_timeout_ms = value.parse().map_err(|_| parse_err(key))?
            }
            "forward.keepaliveidle" => {
                self.forward.keepalive_idle_secs = value.parse().map_err(|_| parse_err(key))?
            }
            "forward.keepaliveinterval" => {
                self.forward.keepalive_interval_secs = value.parse().map_err(|_| parse_err(key))?
            }
            "forward.keepalivecount" => {
                self.forward.keepalive_count = value.parse().map_err(|_| parse_err(key))?
            }

            "health.address" => self.health_addr = value.parse().map_err(|_| parse_err(key))?,

            "log.quiet" => self.log.quiet = parse_bool(value).ok_or_else(|| parse_err(key))?,
            "log.verbose" => self.log.verbose = parse_bool(value).ok_or_else(|| parse_err(key))?,
            "log.file" => self.log.file = Some(value.to_string()),

            other => return Err(Error::config(format!("unknown configuration key {:?}", other))),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.log.quiet && self.log.verbose {
            return Err(Error::config("quiet and verbose are mutually exclusive"));
        }
        if self.relay.peer.public_key.is_none() {
            return Err(Error::config("public key of relay peer is required"));
        }
        if self.relay.private_key.is_none() {
            return Err(Error::config("relay private key is required"));
        }
        if !self.simple {
            if self.e2ee.peer.public_key.is_none() {
                return Err(Error::config("public key of e2ee peer is required"));
            }
            if self.e2ee.private_key.is_none() {
                return Err(Error::config("e2ee private key is required"));
            }
        }
        if self.relay.mtu <= defaults::E2EE_MTU_OVERHEAD {
            return Err(Error::config(format!(
                "mtu {} leaves no room for the nested tunnel",
                self.relay.mtu
            )));
        }
        Ok(())
    }

    /// API alias address honoring the IPv6 switch.
    pub fn api_addr(&self) -> IpAddr {
        if self.disable_ipv6 && self.e2ee.api.is_ipv6() {
            defaults::API_ADDR_V4
        } else {
            self.e2ee.api
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Minimal INI reader: `[Section]` headers and `Key = Value` pairs, `#` and
/// `;` comments. Keys are flattened to `section.key`, lowercase.
fn parse_ini(text: &str, values: &mut HashMap<String, String>) -> Result<()> {
    let mut section = String::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[') {
            let header = header
                .strip_suffix(']')
                .ok_or_else(|| Error::config(format!("line {}: unterminated section", idx + 1)))?;
            section = header.trim().to_ascii_lowercase();
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| Error::config(format!("line {}: expected key = value", idx + 1)))?;
        let key = key.trim().to_ascii_lowercase();
        let flat = if section.is_empty() {
            key
        } else {
            format!("{}.{}", section, key)
        };
        values.insert(flat, value.trim().to_string());
    }
    Ok(())
}

/// `WIREBROKER_RELAY_INTERFACE_PORT=51821` overrides `relay.interface.port`.
fn apply_env(values: &mut HashMap<String, String>) {
    for (key, value) in std::env::vars() {
        let Some(rest) = key.strip_prefix("WIREBROKER_") else {
            continue;
        };
        let flat = rest.to_ascii_lowercase().replace('_', ".");
        values.insert(flat, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_values() -> HashMap<String, String> {
        let mut values = HashMap::new();
        values.insert("relay.interface.privatekey".into(), "k".into());
        values.insert("relay.peer.publickey".into(), "p".into());
        values
    }

    #[test]
    fn defaults_fill_unset_keys() {
        let mut config = BrokerConfig::default();
        config.apply(&minimal_values()).unwrap();
        config.validate().unwrap();

        assert!(config.simple);
        assert_eq!(config.relay.port, defaults::RELAY_PORT);
        assert_eq!(config.relay.mtu, defaults::MTU);
        assert_eq!(config.api_addr(), defaults::API_ADDR);
    }

    #[test]
    fn ini_sections_flatten() {
        let text = r#"
# broker config
[Relay.Interface]
PrivateKey = abc
Port = 51999

[Mapping]
Hosts = a.example:80, b.example
Prefix = 10.9.8
"#;
        let mut values = HashMap::new();
        parse_ini(text, &mut values).unwrap();
        assert_eq!(values["relay.interface.privatekey"], "abc");
        assert_eq!(values["relay.interface.port"], "51999");
        assert_eq!(values["mapping.prefix"], "10.9.8");
    }

    #[test]
    fn e2ee_keys_required_outside_simple_mode() {
        let mut values = minimal_values();
        values.insert("simple".into(), "false".into());
        let mut config = BrokerConfig::default();
        config.apply(&values).unwrap();
        assert!(config.validate().is_err());

        values.insert("e2ee.interface.privatekey".into(), "k".into());
        values.insert("e2ee.peer.publickey".into(), "p".into());
        let mut config = BrokerConfig::default();
        config.apply(&values).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn api_addr_falls_back_without_ipv6() {
        let mut values = minimal_values();
        values.insert("disableipv6".into(), "true".into());
        let mut config = BrokerConfig::default();
        config.apply(&values).unwrap();
        assert_eq!(config.api_addr(), defaults::API_ADDR_V4);
    }

    #[test]
    fn unknown_key_rejected() {
        let mut config = BrokerConfig::default();
        let mut values = HashMap::new();
        values.insert("relay.interface.color".into(), "red".into());
        assert!(config.apply(&values).is_err());
    }
}
