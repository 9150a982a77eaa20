//! Property-based tests for the host-alias table
//!
//! Generated host lists exercise the parser and the table builder: the rule
//! layout invariants must hold for every input shape, not just the
//! hand-written scenarios.

use crate::mapping::{build_table, parse_host_mappings, AliasPrefix, DEFAULT_PORTS};
use proptest::prelude::*;
use std::net::Ipv4Addr;
use wirebroker_netstack::RuleTarget;

fn host_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        // Host names.
        ("[a-z]{1,12}", prop_oneof!["com", "net", "internal"])
            .prop_map(|(name, tld)| format!("{}.{}", name, tld)),
        // Literal addresses.
        (1u8..224, 0u8..=255, 0u8..=255, 1u8..=254)
            .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
    ]
}

fn entry_strategy() -> impl Strategy<Value = (String, Vec<u16>)> {
    (host_strategy(), prop::collection::vec(1u16..=65535, 0..4))
}

fn render(entries: &[(String, Vec<u16>)]) -> String {
    entries
        .iter()
        .map(|(host, ports)| {
            if ports.is_empty() {
                host.clone()
            } else {
                let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
                format!("{}:{}", host, ports.join(":"))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

proptest! {
    // Parsing preserves order, fills default ports, and round-trips.
    #[test]
    fn parse_preserves_entries(entries in prop::collection::vec(entry_strategy(), 0..8)) {
        let parsed = parse_host_mappings(&render(&entries)).unwrap();
        prop_assert_eq!(parsed.len(), entries.len());
        for (mapping, (host, ports)) in parsed.iter().zip(&entries) {
            prop_assert_eq!(&mapping.host, host);
            if ports.is_empty() {
                prop_assert_eq!(&mapping.ports[..], &DEFAULT_PORTS[..]);
            } else {
                prop_assert_eq!(&mapping.ports, ports);
            }
        }
    }

    // The table always carries exactly one DNAT rule per resolved port, one
    // trailing DROP, and chain offsets [0, K+1, K+2, K+3, K+4].
    #[test]
    fn table_layout_invariants(
        resolved in prop::collection::vec(
            (1usize..=200, (1u8..224, 0u8..=255, 0u8..=255, 1u8..=254), 1u16..=65535),
            0..32,
        )
    ) {
        let resolved: Vec<(usize, Ipv4Addr, u16)> = resolved
            .into_iter()
            .map(|(index, (a, b, c, d), port)| (index, Ipv4Addr::new(a, b, c, d), port))
            .collect();

        let prefix = AliasPrefix::parse("10.9.8").unwrap();
        let table = build_table(prefix, &resolved);
        table.validate().unwrap();

        let k = resolved.len();
        let dnat = table.rules.iter().filter(|r| matches!(r.target, RuleTarget::DnatV4 { .. })).count();
        let drops = table.rules.iter().filter(|r| matches!(r.target, RuleTarget::Drop)).count();
        prop_assert_eq!(dnat, k);
        prop_assert_eq!(drops, 1);
        prop_assert_eq!(table.builtin_chains, [0, k + 1, k + 2, k + 3, k + 4]);

        // The DROP sits directly after the DNAT block.
        prop_assert!(matches!(table.rules[k].target, RuleTarget::Drop));
    }
}
