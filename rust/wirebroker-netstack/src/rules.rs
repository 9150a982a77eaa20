//! NAT rule table with builtin chains
//!
//! Models the classic netfilter NAT table: five builtin chains indexing into
//! one flat rule slice. Targets and matchers are closed enums dispatched with
//! a match, not trait objects.

use crate::packet::{ParsedPacket, TransportInfo};
use smoltcp::wire::{IpProtocol, IpVersion};
use std::net::{IpAddr, Ipv4Addr};

pub const NUM_HOOKS: usize = 5;

/// Builtin chain a packet traverses, in netfilter order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Prerouting = 0,
    Input = 1,
    Forward = 2,
    Output = 3,
    Postrouting = 4,
}

/// Terminal decision for one chain traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    /// Destination rewritten; the flow should be steered to `addr:port`.
    Dnat { addr: Ipv4Addr, port: u16 },
    /// Source should be rewritten to the interface address.
    Masquerade,
}

/// Header-level filter evaluated before a rule's matchers.
#[derive(Debug, Clone, Default)]
pub struct IpHeaderFilter {
    /// Protocol the filter nominally carries. Only enforced when
    /// `check_protocol` is set.
    pub protocol: Option<IpProtocol>,
    pub check_protocol: bool,
    /// Destination address with mask, IPv4 rules only.
    pub dst: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl IpHeaderFilter {
    /// Match every packet.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match one exact destination address.
    pub fn dst_host(addr: Ipv4Addr) -> Self {
        Self {
            dst: Some((addr, Ipv4Addr::new(255, 255, 255, 255))),
            ..Self::default()
        }
    }

    fn matches(&self, packet: &ParsedPacket) -> bool {
        if self.check_protocol {
            if let Some(protocol) = self.protocol {
                if packet.protocol != protocol {
                    return false;
                }
            }
        }
        if let Some((addr, mask)) = self.dst {
            let IpAddr::V4(dst) = packet.dst_addr else {
                return false;
            };
            let masked = u32::from(dst) & u32::from(mask);
            if masked != u32::from(addr) & u32::from(mask) {
                return false;
            }
        }
        true
    }
}

/// Rule matcher. Returns `(matched, drop)`: `drop` short-circuits the whole
/// traversal regardless of later rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatcher {
    TcpPort { port: u16 },
}

impl RuleMatcher {
    pub fn matches(&self, packet: &ParsedPacket) -> (bool, bool) {
        match self {
            RuleMatcher::TcpPort { port } => tcp_port_match(packet, *port),
        }
    }
}

// Fragmented TCP never matches; an offset-1 fragment is dropped outright so a
// split TCP header cannot slip past the port filter. IPv6 fragments are not
// special-cased, same as netfilter's xt_tcp.
fn tcp_port_match(packet: &ParsedPacket, port: u16) -> (bool, bool) {
    match packet.version {
        IpVersion::Ipv4 => {
            if packet.protocol != IpProtocol::Tcp {
                return (false, false);
            }
            if packet.frag_offset != 0 {
                if packet.frag_offset == 1 {
                    return (false, true);
                }
                return (false, false);
            }
        }
        IpVersion::Ipv6 => {
            if packet.protocol != IpProtocol::Tcp {
                return (false, false);
            }
        }
    }

    match &packet.transport {
        TransportInfo::Tcp(tcp) => {
            if tcp.dst_port != port {
                (false, false)
            } else {
                (true, false)
            }
        }
        // Protocol number says TCP but there is no valid header to inspect.
        _ => (false, true),
    }
}

/// Rule target, applied when the filter and all matchers pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Accept,
    Drop,
    DnatV4 { addr: Ipv4Addr, port: u16 },
    Masquerade,
}

/// One rule: filter, matchers, target.
#[derive(Debug, Clone)]
pub struct Rule {
    pub filter: IpHeaderFilter,
    pub matchers: Vec<RuleMatcher>,
    pub target: RuleTarget,
}

impl Rule {
    pub fn accept() -> Self {
        Self {
            filter: IpHeaderFilter::any(),
            matchers: Vec::new(),
            target: RuleTarget::Accept,
        }
    }

    pub fn drop() -> Self {
        Self {
            filter: IpHeaderFilter::any(),
            matchers: Vec::new(),
            target: RuleTarget::Drop,
        }
    }
}

/// A NAT table: flat rule slice plus one entry offset per builtin chain.
#[derive(Debug, Clone)]
pub struct RuleTable {
    pub rules: Vec<Rule>,
    pub builtin_chains: [usize; NUM_HOOKS],
}

impl RuleTable {
    /// Table whose every chain accepts immediately.
    pub fn accept_all() -> Self {
        Self {
            rules: (0..NUM_HOOKS).map(|_| Rule::accept()).collect(),
            builtin_chains: [0, 1, 2, 3, 4],
        }
    }

    /// Entry offsets must point into the rule slice.
    pub fn validate(&self) -> Result<(), String> {
        for (hook, &offset) in self.builtin_chains.iter().enumerate() {
            if offset >= self.rules.len() {
                return Err(format!(
                    "chain {} starts at {} but table has {} rules",
                    hook,
                    offset,
                    self.rules.len()
                ));
            }
        }
        Ok(())
    }

    /// Walk a chain until a terminating target. A matcher-requested drop wins
    /// over everything after it. Running off the end accepts.
    pub fn check(&self, hook: Hook, packet: &ParsedPacket) -> Verdict {
        let start = self.builtin_chains[hook as usize];
        let Some(rules) = self.rules.get(start..) else {
            return Verdict::Accept;
        };
        for rule in rules {
            if !rule.filter.matches(packet) {
                continue;
            }

            let mut matched = true;
            let mut force_drop = false;
            for matcher in &rule.matchers {
                let (hit, drop) = matcher.matches(packet);
                if drop {
                    force_drop = true;
                    break;
                }
                if !hit {
                    matched = false;
                    break;
                }
            }
            if force_drop {
                return Verdict::Drop;
            }
            if !matched {
                continue;
            }

            match &rule.target {
                RuleTarget::Accept => return Verdict::Accept,
                RuleTarget::Drop => return Verdict::Drop,
                RuleTarget::DnatV4 { addr, port } => {
                    return Verdict::Dnat { addr: *addr, port: *port }
                }
                RuleTarget::Masquerade => return Verdict::Masquerade,
            }
        }
        Verdict::Accept
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::accept_all()
    }
}
