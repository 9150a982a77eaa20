//! Host-alias NAT
//!
//! Maps synthetic `<prefix>.i` addresses (one per configured host, 1-based,
//! dense) onto resolved real IPv4 addresses with per-port DNAT rules. The
//! whole table is rebuilt and swapped atomically on every refresh, so a host
//! that stops resolving loses its rules rather than keeping stale ones, and
//! no packet ever sees a half-updated table.

use crate::config::MappingConfig;
use crate::error::{Error, Result};
use crate::gateway::GatewayClient;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wirebroker_netstack::{
    IpHeaderFilter, IpProtocol, Rule, RuleMatcher, RuleTable, RuleTarget, Stack,
};

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_PORTS: [u16; 2] = [80, 443];

/// One configured host with its port filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMapping {
    pub host: String,
    pub ports: Vec<u16>,
}

/// Parse `host[:port[:port...]]` entries, comma-separated. Whitespace around
/// entries is trimmed and empty entries skipped; hosts without ports get the
/// defaults.
pub fn parse_host_mappings(input: &str) -> Result<Vec<HostMapping>> {
    let mut result = Vec::new();
    for entry in input.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let mut parts = entry.split(':');
        let host = parts.next().unwrap_or_default().to_string();
        let mut ports = Vec::new();
        for part in parts {
            let port: u16 = part
                .parse()
                .map_err(|_| Error::config(format!("invalid port value {:?} in {:?}", part, entry)))?;
            ports.push(port);
        }
        if ports.is_empty() {
            ports.extend(DEFAULT_PORTS);
        }

        result.push(HostMapping { host, ports });
    }
    Ok(result)
}

/// The `<prefix>` of `<prefix>.i`: a /24 host-zero network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasPrefix(Ipv4Addr);

impl AliasPrefix {
    /// Accepts `10.9.8` and `10.9.8.` forms.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim().trim_end_matches('.');
        let host_zero: Ipv4Addr = format!("{}.0", trimmed)
            .parse()
            .map_err(|_| Error::config(format!("invalid mapping prefix {:?}", text)))?;
        if host_zero.octets()[3] != 0 {
            return Err(Error::config(format!("mapping prefix {:?} is not a /24 host-zero", text)));
        }
        Ok(Self(host_zero))
    }

    /// Synthetic address for 1-based index `i`.
    pub fn alias(&self, index: usize) -> Ipv4Addr {
        let [a, b, c, _] = self.0.octets();
        Ipv4Addr::new(a, b, c, index as u8)
    }

    /// Dotted rendering with trailing dot, e.g. `10.9.8.`.
    pub fn dotted(&self) -> String {
        let [a, b, c, _] = self.0.octets();
        format!("{}.{}.{}.", a, b, c)
    }
}

/// Resolve a host entry to IPv4. Literal addresses pass through; names go to
/// the system resolver and only IPv4 answers count.
pub async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(_) => Err(Error::Resolve {
                host: host.to_string(),
                message: "alias mapping is IPv4-only".into(),
            }),
        };
    }

    let addrs = tokio::net::lookup_host((host, 0)).await.map_err(|e| Error::Resolve {
        host: host.to_string(),
        message: e.to_string(),
    })?;
    addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::Resolve {
            host: host.to_string(),
            message: "no IPv4 address".into(),
        })
}

/// Build the NAT table from resolved `(index, address, port)` triples.
///
/// Layout: one DNAT rule per resolved port in input order, then the default
/// DROP; ACCEPT entry points for Input/Forward/Output; MASQUERADE plus
/// ACCEPT for Postrouting. Offsets are `[0, K+1, K+2, K+3, K+4]` for K DNAT
/// rules.
pub fn build_table(prefix: AliasPrefix, resolved: &[(usize, Ipv4Addr, u16)]) -> RuleTable {
    let mut rules = Vec::with_capacity(resolved.len() + 6);

    for &(index, address, port) in resolved {
        rules.push(Rule {
            filter: IpHeaderFilter::dst_host(prefix.alias(index)),
            matchers: vec![RuleMatcher::TcpPort { port }],
            target: RuleTarget::DnatV4 { addr: address, port },
        });
    }

    let preroutes = rules.len();

    // Anything addressed to the alias prefix that missed every DNAT rule is
    // refused here rather than leaking into the host.
    rules.push(Rule::drop());

    rules.push(Rule::accept()); // Input
    rules.push(Rule::accept()); // Forward
    rules.push(Rule::accept()); // Output

    rules.push(Rule {
        filter: IpHeaderFilter {
            protocol: Some(IpProtocol::Tcp),
            check_protocol: false,
            dst: None,
        },
        matchers: Vec::new(),
        target: RuleTarget::Masquerade,
    });
    rules.push(Rule::accept()); // Postrouting fallthrough

    RuleTable {
        rules,
        builtin_chains: [0, preroutes + 1, preroutes + 2, preroutes + 3, preroutes + 4],
    }
}

/// Periodic resolver and table installer.
pub struct MappingManager {
    stack: Stack,
    config: MappingConfig,
    gateway: Option<Arc<GatewayClient>>,
}

impl MappingManager {
    pub fn new(stack: Stack, config: MappingConfig, gateway: Option<Arc<GatewayClient>>) -> Self {
        Self { stack, config, gateway }
    }

    /// Resolve every entry and swap in a fresh table. On the first
    /// installation the host list is also reported to the gateway.
    pub async fn install(&self, first: bool) -> Result<()> {
        let mappings = parse_host_mappings(&self.config.hosts)?;
        let prefix = AliasPrefix::parse(&self.config.prefix)?;

        for mapping in &mappings {
            debug!("host: {}, ports: {:?}", mapping.host, mapping.ports);
        }

        if first {
            if let Some(gateway) = &self.gateway {
                if let Err(err) = gateway.put_configuration(&mappings, &prefix.dotted()).await {
                    warn!("failed reporting mapping to gateway: {}", err);
                }
            }
        }

        let mut resolved = Vec::new();
        for (idx, mapping) in mappings.iter().enumerate() {
            let index = idx + 1;
            match resolve_ipv4(&mapping.host).await {
                Ok(address) => {
                    for &port in &mapping.ports {
                        resolved.push((index, address, port));
                    }
                }
                Err(err) => {
                    // This generation simply has no rules for the slot; the
                    // index stays reserved so later hosts keep their aliases.
                    warn!("{}", err);
                }
            }
        }

        let table = build_table(prefix, &resolved);
        info!(
            "installing alias table: {} dnat rule(s) for {} host(s) under {}",
            resolved.len(),
            mappings.len(),
            prefix.dotted()
        );

        let _guard = self.stack.lock().lock().await;
        self.stack.replace_nat_table(table, false)?;
        Ok(())
    }

    /// Refresh the table every ten minutes, forever. The caller does the
    /// initial install synchronously so startup fails loudly.
    pub async fn refresh_loop(self) {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the interval's immediate first tick
        loop {
            ticker.tick().await;
            if let Err(err) = self.install(false).await {
                warn!("alias refresh failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirebroker_netstack::{parse_packet, Hook, TcpFlags, Verdict};

    #[test]
    fn parses_hosts_with_ports_and_defaults() {
        let parsed =
            parse_host_mappings("a.example:80:443, b.example ,, 10.4.1.2:8080").unwrap();
        assert_eq!(
            parsed,
            vec![
                HostMapping { host: "a.example".into(), ports: vec![80, 443] },
                HostMapping { host: "b.example".into(), ports: vec![80, 443] },
                HostMapping { host: "10.4.1.2".into(), ports: vec![8080] },
            ]
        );
    }

    #[test]
    fn host_list_round_trips_through_parse() {
        let parsed = parse_host_mappings("a.example:80:443,b.example").unwrap();
        let rendered: Vec<String> = parsed
            .iter()
            .map(|m| {
                let ports: Vec<String> = m.ports.iter().map(|p| p.to_string()).collect();
                format!("{}:{}", m.host, ports.join(":"))
            })
            .collect();
        let reparsed = parse_host_mappings(&rendered.join(",")).unwrap();
        assert_eq!(parsed, reparsed);
    }

    #[test]
    fn invalid_port_rejected() {
        assert!(parse_host_mappings("a.example:eighty").is_err());
        assert!(parse_host_mappings("a.example:70000").is_err());
    }

    #[test]
    fn prefix_accepts_both_spellings() {
        let bare = AliasPrefix::parse("10.9.8").unwrap();
        let dotted = AliasPrefix::parse("10.9.8.").unwrap();
        assert_eq!(bare, dotted);
        assert_eq!(bare.alias(1), Ipv4Addr::new(10, 9, 8, 1));
        assert_eq!(bare.dotted(), "10.9.8.");
        assert!(AliasPrefix::parse("10.9").is_err());
        assert!(AliasPrefix::parse("not.a.prefix").is_err());
    }

    fn syn(dst: Ipv4Addr, port: u16, frag_offset: u16) -> wirebroker_netstack::ParsedPacket {
        let raw = wirebroker_netstack::packet::build_tcp(
            "192.168.0.1:9999".parse().unwrap(),
            std::net::SocketAddr::new(dst.into(), port),
            1,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            None,
        );
        let mut parsed = parse_packet(&raw).unwrap();
        if frag_offset != 0 {
            parsed.frag_offset = frag_offset;
            parsed.transport = wirebroker_netstack::TransportInfo::Fragment;
        }
        parsed
    }

    // Scenario: two hosts, explicit and default ports.
    #[test]
    fn alias_fan_out() {
        let prefix = AliasPrefix::parse("10.9.8").unwrap();
        let a = Ipv4Addr::new(198, 51, 100, 1);
        let b = Ipv4Addr::new(198, 51, 100, 2);
        let resolved = vec![(1, a, 80), (1, a, 443), (2, b, 80), (2, b, 443)];
        let table = build_table(prefix, &resolved);

        // Four DNAT rules, one trailing DROP, chain offsets [0, K+1..K+4].
        let dnat_count = table
            .rules
            .iter()
            .filter(|r| matches!(r.target, RuleTarget::DnatV4 { .. }))
            .count();
        assert_eq!(dnat_count, 4);
        assert_eq!(
            table.rules.iter().filter(|r| matches!(r.target, RuleTarget::Drop)).count(),
            1
        );
        assert_eq!(table.builtin_chains, [0, 5, 6, 7, 8]);
        table.validate().unwrap();

        for (alias_index, port, expect) in
            [(1, 80, a), (1, 443, a), (2, 80, b), (2, 443, b)]
        {
            let packet = syn(prefix.alias(alias_index), port, 0);
            assert_eq!(
                table.check(Hook::Prerouting, &packet),
                Verdict::Dnat { addr: expect, port }
            );
        }
    }

    // Scenario: first host fails DNS; its slot has no rules but keeps its
    // index, and traffic to it dies in the default DROP.
    #[test]
    fn unresolvable_host_skipped() {
        let prefix = AliasPrefix::parse("10.9.8").unwrap();
        let b = Ipv4Addr::new(198, 51, 100, 2);
        let resolved = vec![(2, b, 80), (2, b, 443)];
        let table = build_table(prefix, &resolved);

        assert_eq!(table.builtin_chains, [0, 3, 4, 5, 6]);

        let packet = syn(prefix.alias(2), 80, 0);
        assert_eq!(
            table.check(Hook::Prerouting, &packet),
            Verdict::Dnat { addr: b, port: 80 }
        );

        let packet = syn(prefix.alias(1), 80, 0);
        assert_eq!(table.check(Hook::Prerouting, &packet), Verdict::Drop);
    }

    // Scenario: a fragment with offset 1 aimed at a mapped port is dropped
    // by the matcher, not forwarded.
    #[test]
    fn fragment_evasion_dropped() {
        let prefix = AliasPrefix::parse("10.9.8").unwrap();
        let table = build_table(prefix, &[(1, Ipv4Addr::new(198, 51, 100, 1), 80)]);

        let packet = syn(prefix.alias(1), 80, 1);
        assert_eq!(table.check(Hook::Prerouting, &packet), Verdict::Drop);
    }

    // Invariant: DNAT rule count equals the resolved port count for any host
    // list shape.
    #[test]
    fn rule_count_matches_resolved_ports() {
        let prefix = AliasPrefix::parse("172.20.0").unwrap();
        for host_count in 0..5usize {
            let resolved: Vec<(usize, Ipv4Addr, u16)> = (0..host_count)
                .flat_map(|i| {
                    let address = Ipv4Addr::new(203, 0, 113, (i + 1) as u8);
                    [(i + 1, address, 80), (i + 1, address, 443)]
                })
                .collect();
            let table = build_table(prefix, &resolved);
            let dnat_count = table
                .rules
                .iter()
                .filter(|r| matches!(r.target, RuleTarget::DnatV4 { .. }))
                .count();
            assert_eq!(dnat_count, resolved.len());
            assert_eq!(table.rules.len(), resolved.len() + 6);
            let k = resolved.len();
            assert_eq!(table.builtin_chains, [0, k + 1, k + 2, k + 3, k + 4]);
        }
    }

    #[tokio::test]
    async fn literal_addresses_resolve_without_dns() {
        assert_eq!(
            resolve_ipv4("203.0.113.7").await.unwrap(),
            Ipv4Addr::new(203, 0, 113, 7)
        );
        assert!(resolve_ipv4("2001:db8::1").await.is_err());
    }
}
