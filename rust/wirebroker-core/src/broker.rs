//! Supervisor
//!
//! Owns the stacks and tunnel devices, wires the forwarders, ICMP relay,
//! host-alias mapping and health endpoint to whichever stack handles
//! transport (the nested stack when present, else the relay), and runs
//! until interrupted.

use crate::config::{defaults, BrokerConfig, PeerEntry};
use crate::error::{Error, Result};
use crate::forward::{TcpForwarder, UdpForwarder};
use crate::gateway::GatewayClient;
use crate::health;
use crate::icmp;
use crate::mapping::MappingManager;
use cidr::IpCidr;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use wirebroker_netstack::{IpVersion, Stack};
use wirebroker_tunnel::{keys, Device, HostTransport, NetstackTransport, PeerConfig, TunnelConfig};

/// The two virtual stacks and which of them owns the transport handlers.
pub struct StackSet {
    pub relay: Stack,
    pub e2ee: Option<Stack>,
}

impl StackSet {
    /// The stack the forwarders, ICMP and alias table attach to.
    pub fn transport_handler(&self) -> &Stack {
        self.e2ee.as_ref().unwrap_or(&self.relay)
    }
}

/// Build both stacks and set their mode bits. In simple mode the API alias
/// joins the relay interface; in nested mode the relay bridges the inner
/// tunnel's traffic and the inner stack runs 80 bytes under the relay MTU.
pub fn build_stacks(config: &BrokerConfig) -> StackSet {
    let mut relay_addrs: Vec<IpAddr> = vec![config.relay.ipv4.into()];
    if !config.disable_ipv6 {
        relay_addrs.push(config.relay.ipv6.into());
    }
    if config.simple {
        relay_addrs.push(config.api_addr());
    }
    let relay = Stack::new(config.relay.mtu, relay_addrs);

    let e2ee = if config.simple {
        None
    } else {
        relay.set_forwarding(IpVersion::Ipv4, true);
        if !config.disable_ipv6 {
            relay.set_forwarding(IpVersion::Ipv6, true);
        }

        let mut addrs: Vec<IpAddr> = vec![config.e2ee.ipv4.into()];
        if !config.disable_ipv6 {
            addrs.push(config.e2ee.ipv6.into());
        }
        addrs.push(config.api_addr());
        Some(Stack::new(
            config.relay.mtu - defaults::E2EE_MTU_OVERHEAD,
            addrs,
        ))
    };

    let set = StackSet { relay, e2ee };
    set.transport_handler().set_promiscuous(true);
    set
}

fn decode_key(value: Option<&str>, what: &str) -> Result<[u8; 32]> {
    let value = value.ok_or_else(|| Error::config(format!("{} is required", what)))?;
    keys::decode_base64(value).map_err(|e| Error::config(format!("bad {}: {}", what, e)))
}

async fn resolve_endpoint(text: &str) -> Result<SocketAddr> {
    if let Ok(addr) = text.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(text)
        .await
        .map_err(|e| Error::config(format!("cannot resolve endpoint {:?}: {}", text, e)))?
        .next()
        .ok_or_else(|| Error::config(format!("endpoint {:?} has no addresses", text)))
}

fn parse_allowed(entries: &[String], disable_ipv6: bool) -> Result<Vec<IpCidr>> {
    let mut allowed = Vec::new();
    for entry in entries {
        let net: IpCidr = entry
            .parse()
            .map_err(|_| Error::config(format!("invalid allowed prefix {:?}", entry)))?;
        if disable_ipv6 && matches!(net, IpCidr::V6(_)) {
            continue;
        }
        allowed.push(net);
    }
    Ok(allowed)
}

async fn build_peer(entry: &PeerEntry, what: &str, disable_ipv6: bool) -> Result<PeerConfig> {
    let mut peer = PeerConfig::new(decode_key(entry.public_key.as_deref(), what)?);
    if let Some(endpoint) = &entry.endpoint {
        peer.endpoint = Some(resolve_endpoint(endpoint).await?);
    }
    peer.persistent_keepalive = entry.keepalive;
    peer.allowed_ips = parse_allowed(&entry.allowed, disable_ipv6)?;
    Ok(peer)
}

/// Assemble the relay tunnel's configuration from the broker config.
pub async fn build_relay_tunnel(config: &BrokerConfig) -> Result<TunnelConfig> {
    let mut addresses: Vec<IpCidr> = vec![format!("{}/32", config.relay.ipv4)
        .parse()
        .map_err(|_| Error::config("bad relay ipv4 address"))?];
    if !config.disable_ipv6 {
        addresses.push(
            format!("{}/128", config.relay.ipv6)
                .parse()
                .map_err(|_| Error::config("bad relay ipv6 address"))?,
        );
    }

    Ok(TunnelConfig {
        private_key: decode_key(config.relay.private_key.as_deref(), "relay private key")?,
        listen_port: Some(config.relay.port),
        addresses,
        mtu: config.relay.mtu,
        peers: vec![build_peer(&config.relay.peer, "relay peer public key", config.disable_ipv6).await?],
    })
}

/// Assemble the nested tunnel's configuration. MTU sits 80 bytes under the
/// relay's to leave room for the nested encapsulation.
pub async fn build_e2ee_tunnel(config: &BrokerConfig) -> Result<TunnelConfig> {
    let mut addresses: Vec<IpCidr> = vec![format!("{}/32", config.e2ee.ipv4)
        .parse()
        .map_err(|_| Error::config("bad e2ee ipv4 address"))?];
    if !config.disable_ipv6 {
        addresses.push(
            format!("{}/128", config.e2ee.ipv6)
                .parse()
                .map_err(|_| Error::config("bad e2ee ipv6 address"))?,
        );
    }

    Ok(TunnelConfig {
        private_key: decode_key(config.e2ee.private_key.as_deref(), "e2ee private key")?,
        listen_port: Some(defaults::E2EE_PORT),
        addresses,
        mtu: config.relay.mtu - defaults::E2EE_MTU_OVERHEAD,
        peers: vec![build_peer(&config.e2ee.peer, "e2ee peer public key", config.disable_ipv6).await?],
    })
}

fn print_shareable(title: &str, tunnel: &TunnelConfig) {
    println!();
    println!("{}:", title);
    println!("{}", "─".repeat(32));
    print!("{}", tunnel.to_shareable());
    println!("{}", "─".repeat(32));
}

/// Run the broker until interrupted.
pub async fn run(config: BrokerConfig) -> Result<()> {
    let gateway = GatewayClient::new(&config.gateway)?.map(Arc::new);

    let relay_tunnel = build_relay_tunnel(&config).await?;
    let e2ee_tunnel = if config.simple {
        None
    } else {
        Some(build_e2ee_tunnel(&config).await?)
    };

    if let Some(gateway) = &gateway {
        let public_key = keys::encode_base64(&relay_tunnel.public_key());
        if let Err(err) = gateway.verify_client_public_key(&public_key).await {
            warn!("gateway key verification failed: {}", err);
        }
    }

    print_shareable("Relay configuration", &relay_tunnel);
    if let Some(tunnel) = &e2ee_tunnel {
        print_shareable("E2EE configuration", tunnel);
    }
    println!();

    info!("MTU: {}", config.relay.mtu);

    let stacks = build_stacks(&config);
    let transport_stack = stacks.transport_handler().clone();

    let relay_device = Arc::new(Device::new(
        "relay",
        stacks.relay.clone(),
        Arc::new(HostTransport::bind(config.relay.port)?),
    ));

    let e2ee_device = match (&stacks.e2ee, &e2ee_tunnel) {
        (Some(stack), Some(_)) => {
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), defaults::E2EE_PORT);
            let socket = stacks.relay.udp_bind(bind_addr)?;
            Some(Arc::new(Device::new(
                "e2ee",
                stack.clone(),
                Arc::new(NetstackTransport::new(socket)),
            )))
        }
        _ => None,
    };

    // Transport handler registration is a startup-only stack mutation.
    {
        let _guard = transport_stack.lock().lock().await;
        transport_stack.set_tcp_handler(Arc::new(TcpForwarder::new(
            transport_stack.clone(),
            &config.forward,
        )));
        transport_stack.set_udp_handler(Arc::new(UdpForwarder::new(transport_stack.clone())));
    }

    let echo_requests = transport_stack
        .take_echo_requests()
        .ok_or_else(|| Error::config("echo intake already taken"))?;

    relay_device.configure(&relay_tunnel).await?;
    relay_device.up()?;
    if let (Some(device), Some(tunnel)) = (&e2ee_device, &e2ee_tunnel) {
        device.configure(tunnel).await?;
        device.up()?;
    }

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    tasks.push(tokio::spawn(icmp::run(transport_stack.clone(), echo_requests)));

    if config.mapping.enabled() {
        let manager = MappingManager::new(transport_stack.clone(), config.mapping.clone(), gateway.clone());
        manager.install(true).await?;
        tasks.push(tokio::spawn(manager.refresh_loop()));
    } else {
        info!("host-alias mapping disabled: no prefix configured");
    }

    {
        let device = relay_device.clone();
        let addr = config.health_addr;
        tasks.push(tokio::spawn(async move {
            if let Err(err) = health::serve(addr, device).await {
                error!("health endpoint failed: {}", err);
            }
        }));
    }

    info!("broker up, proxying into the local network");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    relay_device.down();
    if let Some(device) = &e2ee_device {
        device.down();
    }
    for task in tasks {
        task.abort();
    }
    Ok(())
}
