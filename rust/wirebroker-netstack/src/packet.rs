//! Packet parsing and building using smoltcp wire types

use crate::error::{NetstackError, Result};
use smoltcp::wire::{IpProtocol, IpVersion, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_ECHO_HEADER_LEN: usize = 8;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

/// Parsed view of one IP packet from the virtual interface.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub version: IpVersion,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: IpProtocol,
    /// IPv4 fragment offset in 8-octet units; always 0 for IPv6.
    pub frag_offset: u16,
    pub payload_offset: usize,
    /// Length of the IP payload as declared by the IP header.
    pub ip_payload_len: usize,
    pub transport: TransportInfo,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    IcmpEchoRequest(EchoInfo),
    Icmp,
    /// Non-first fragment; the transport header lives in another packet.
    Fragment,
    /// Protocol number says TCP/UDP but the header does not fit.
    Truncated,
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub header_len: usize,
}

#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub struct EchoInfo {
    pub ident: u16,
    pub seq_no: u16,
    pub payload_offset: usize,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(self.src_addr, t.src_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(self.src_addr, u.src_port)),
            _ => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddr::new(self.dst_addr, t.dst_port)),
            TransportInfo::Udp(u) => Some(SocketAddr::new(self.dst_addr, u.dst_port)),
            _ => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, TransportInfo::Tcp(t) if t.flags.syn && !t.flags.ack)
    }
}

/// Parse an IP packet
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(NetstackError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = (data[0] >> 4) & 0x0F;
    match version {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        _ => Err(NetstackError::InvalidIpVersion(version)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv4Packet::new_checked(data)
        .map_err(|e| NetstackError::InvalidPacket(format!("IPv4: {}", e)))?;

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    let protocol = pkt.next_header();
    let src = pkt.src_addr();
    let dst = pkt.dst_addr();

    // Fragment offset field in 8-octet units, before smoltcp's byte scaling.
    let frag_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1FFF;

    let ip_payload_len = pkt.payload().len();
    let transport = if frag_offset != 0 {
        TransportInfo::Fragment
    } else {
        parse_transport(protocol, pkt.payload())
    };

    Ok(ParsedPacket {
        version: IpVersion::Ipv4,
        src_addr: IpAddr::V4(src),
        dst_addr: IpAddr::V4(dst),
        protocol,
        frag_offset,
        payload_offset: ihl,
        ip_payload_len,
        transport,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<ParsedPacket> {
    let pkt = Ipv6Packet::new_checked(data)
        .map_err(|e| NetstackError::InvalidPacket(format!("IPv6: {}", e)))?;

    let protocol = pkt.next_header();
    let src = pkt.src_addr();
    let dst = pkt.dst_addr();
    let ip_payload_len = pkt.payload().len();
    let transport = parse_transport(protocol, pkt.payload());

    Ok(ParsedPacket {
        version: IpVersion::Ipv6,
        src_addr: IpAddr::V6(src),
        dst_addr: IpAddr::V6(dst),
        protocol,
        frag_offset: 0,
        payload_offset: IPV6_HEADER_LEN,
        ip_payload_len,
        transport,
    })
}

fn parse_transport(protocol: IpProtocol, payload: &[u8]) -> TransportInfo {
    match protocol {
        IpProtocol::Tcp => parse_tcp(payload),
        IpProtocol::Udp => parse_udp(payload),
        IpProtocol::Icmp => parse_icmp(payload, 8),
        IpProtocol::Icmpv6 => parse_icmp(payload, 128),
        _ => TransportInfo::Other(protocol.into()),
    }
}

fn parse_tcp(data: &[u8]) -> TransportInfo {
    let pkt = match TcpPacket::new_checked(data) {
        Ok(pkt) => pkt,
        Err(_) => return TransportInfo::Truncated,
    };

    let header_len = pkt.header_len() as usize;
    if header_len < TCP_MIN_HEADER_LEN || data.len() < header_len {
        return TransportInfo::Truncated;
    }

    let mut mss = None;
    if header_len > TCP_MIN_HEADER_LEN {
        let opts = &data[TCP_MIN_HEADER_LEN..header_len];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => i += 1,
                2 if i + 4 <= opts.len() => {
                    mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
                    i += 4;
                }
                _ => {
                    if i + 1 < opts.len() && opts[i + 1] > 1 {
                        i += opts[i + 1] as usize;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    TransportInfo::Tcp(TcpInfo {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
        header_len,
    })
}

fn parse_udp(data: &[u8]) -> TransportInfo {
    match UdpPacket::new_checked(data) {
        Ok(pkt) => TransportInfo::Udp(UdpInfo {
            src_port: pkt.src_port(),
            dst_port: pkt.dst_port(),
            payload_len: pkt.payload().len(),
        }),
        Err(_) => TransportInfo::Truncated,
    }
}

// Echo request/reply share the layout: type, code, checksum, ident, seq.
fn parse_icmp(data: &[u8], echo_request_type: u8) -> TransportInfo {
    if data.len() < ICMP_ECHO_HEADER_LEN {
        return TransportInfo::Icmp;
    }
    if data[0] != echo_request_type || data[1] != 0 {
        return TransportInfo::Icmp;
    }
    TransportInfo::IcmpEchoRequest(EchoInfo {
        ident: u16::from_be_bytes([data[4], data[5]]),
        seq_no: u16::from_be_bytes([data[6], data[7]]),
        payload_offset: ICMP_ECHO_HEADER_LEN,
    })
}

fn next_ip_id() -> u16 {
    IP_ID.fetch_add(1, Ordering::Relaxed)
}

fn build_ipv4_header(pkt: &mut [u8], protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, total_len: usize) {
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[4..6].copy_from_slice(&next_ip_id().to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = protocol;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    let cksum = checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&cksum.to_be_bytes());
}

fn build_ipv6_header(pkt: &mut [u8], next_header: u8, src: Ipv6Addr, dst: Ipv6Addr, payload_len: usize) {
    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    pkt[6] = next_header;
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&src.octets());
    pkt[24..40].copy_from_slice(&dst.octets());
}

fn write_tcp_header(
    tcp: &mut [u8],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    header_len: usize,
    mss: Option<u16>,
) {
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((header_len / 4) as u8) << 4;
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    if flags.syn {
        if let Some(mss_val) = mss {
            tcp[20] = 2;
            tcp[21] = 4;
            tcp[22..24].copy_from_slice(&mss_val.to_be_bytes());
        }
    }
}

/// Build a TCP segment inside an IPv4 or IPv6 packet.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
    mss: Option<u16>,
) -> Vec<u8> {
    let tcp_opts_len = if flags.syn && mss.is_some() { 4 } else { 0 };
    let tcp_hdr_len = TCP_MIN_HEADER_LEN + tcp_opts_len;

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total_len = IPV4_HEADER_LEN + tcp_hdr_len + payload.len();
            let mut pkt = vec![0u8; total_len];
            build_ipv4_header(&mut pkt, 6, src_ip, dst_ip, total_len);

            let tcp_start = IPV4_HEADER_LEN;
            write_tcp_header(
                &mut pkt[tcp_start..], src.port(), dst.port(), seq, ack, flags, window,
                tcp_hdr_len, mss,
            );
            pkt[tcp_start + tcp_hdr_len..].copy_from_slice(payload);

            let cksum = transport_checksum_v4(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[tcp_start..]);
            pkt[tcp_start + 16..tcp_start + 18].copy_from_slice(&cksum.to_be_bytes());
            pkt
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let seg_len = tcp_hdr_len + payload.len();
            let mut pkt = vec![0u8; IPV6_HEADER_LEN + seg_len];
            build_ipv6_header(&mut pkt, 6, src_ip, dst_ip, seg_len);

            let tcp_start = IPV6_HEADER_LEN;
            write_tcp_header(
                &mut pkt[tcp_start..], src.port(), dst.port(), seq, ack, flags, window,
                tcp_hdr_len, mss,
            );
            pkt[tcp_start + tcp_hdr_len..].copy_from_slice(payload);

            let cksum = transport_checksum_v6(&src_ip.octets(), &dst_ip.octets(), 6, &pkt[tcp_start..]);
            pkt[tcp_start + 16..tcp_start + 18].copy_from_slice(&cksum.to_be_bytes());
            pkt
        }
        _ => Vec::new(),
    }
}

/// Build a UDP datagram inside an IPv4 or IPv6 packet.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total_len = IPV4_HEADER_LEN + udp_len;
            let mut pkt = vec![0u8; total_len];
            build_ipv4_header(&mut pkt, 17, src_ip, dst_ip, total_len);

            let udp_start = IPV4_HEADER_LEN;
            pkt[udp_start..udp_start + 2].copy_from_slice(&src.port().to_be_bytes());
            pkt[udp_start + 2..udp_start + 4].copy_from_slice(&dst.port().to_be_bytes());
            pkt[udp_start + 4..udp_start + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            pkt[udp_start + UDP_HEADER_LEN..].copy_from_slice(payload);

            let cksum = transport_checksum_v4(&src_ip.octets(), &dst_ip.octets(), 17, &pkt[udp_start..]);
            let cksum = if cksum == 0 { 0xFFFF } else { cksum };
            pkt[udp_start + 6..udp_start + 8].copy_from_slice(&cksum.to_be_bytes());
            pkt
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let mut pkt = vec![0u8; IPV6_HEADER_LEN + udp_len];
            build_ipv6_header(&mut pkt, 17, src_ip, dst_ip, udp_len);

            let udp_start = IPV6_HEADER_LEN;
            pkt[udp_start..udp_start + 2].copy_from_slice(&src.port().to_be_bytes());
            pkt[udp_start + 2..udp_start + 4].copy_from_slice(&dst.port().to_be_bytes());
            pkt[udp_start + 4..udp_start + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            pkt[udp_start + UDP_HEADER_LEN..].copy_from_slice(payload);

            let cksum = transport_checksum_v6(&src_ip.octets(), &dst_ip.octets(), 17, &pkt[udp_start..]);
            let cksum = if cksum == 0 { 0xFFFF } else { cksum };
            pkt[udp_start + 6..udp_start + 8].copy_from_slice(&cksum.to_be_bytes());
            pkt
        }
        _ => Vec::new(),
    }
}

/// Build an ICMP echo reply mirroring a request's identifier and sequence.
pub fn build_echo_reply(src: IpAddr, dst: IpAddr, ident: u16, seq_no: u16, payload: &[u8]) -> Vec<u8> {
    let icmp_len = ICMP_ECHO_HEADER_LEN + payload.len();

    match (src, dst) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total_len = IPV4_HEADER_LEN + icmp_len;
            let mut pkt = vec![0u8; total_len];
            build_ipv4_header(&mut pkt, 1, src_ip, dst_ip, total_len);

            let icmp_start = IPV4_HEADER_LEN;
            pkt[icmp_start] = 0; // echo reply
            pkt[icmp_start + 4..icmp_start + 6].copy_from_slice(&ident.to_be_bytes());
            pkt[icmp_start + 6..icmp_start + 8].copy_from_slice(&seq_no.to_be_bytes());
            pkt[icmp_start + ICMP_ECHO_HEADER_LEN..].copy_from_slice(payload);

            let cksum = checksum(&pkt[icmp_start..]);
            pkt[icmp_start + 2..icmp_start + 4].copy_from_slice(&cksum.to_be_bytes());
            pkt
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let mut pkt = vec![0u8; IPV6_HEADER_LEN + icmp_len];
            build_ipv6_header(&mut pkt, 58, src_ip, dst_ip, icmp_len);

            let icmp_start = IPV6_HEADER_LEN;
            pkt[icmp_start] = 129; // echo reply
            pkt[icmp_start + 4..icmp_start + 6].copy_from_slice(&ident.to_be_bytes());
            pkt[icmp_start + 6..icmp_start + 8].copy_from_slice(&seq_no.to_be_bytes());
            pkt[icmp_start + ICMP_ECHO_HEADER_LEN..].copy_from_slice(payload);

            let cksum = transport_checksum_v6(&src_ip.octets(), &dst_ip.octets(), 58, &pkt[icmp_start..]);
            pkt[icmp_start + 2..icmp_start + 4].copy_from_slice(&cksum.to_be_bytes());
            pkt
        }
        _ => Vec::new(),
    }
}

/// Rewrite the source address of a forwarded packet in place, fixing the IP
/// header checksum and the transport checksum.
pub fn rewrite_src(raw: &mut [u8], parsed: &ParsedPacket, new_src: IpAddr) -> Result<()> {
    match (parsed.version, new_src) {
        (IpVersion::Ipv4, IpAddr::V4(addr)) => {
            if raw.len() < IPV4_HEADER_LEN {
                return Err(NetstackError::PacketTooShort { expected: IPV4_HEADER_LEN, actual: raw.len() });
            }
            raw[12..16].copy_from_slice(&addr.octets());
            raw[10..12].copy_from_slice(&[0, 0]);
            let ihl = ((raw[0] & 0x0F) as usize) * 4;
            let cksum = checksum(&raw[..ihl]);
            raw[10..12].copy_from_slice(&cksum.to_be_bytes());
            fixup_transport_checksum(raw, parsed, ihl)
        }
        (IpVersion::Ipv6, IpAddr::V6(addr)) => {
            if raw.len() < IPV6_HEADER_LEN {
                return Err(NetstackError::PacketTooShort { expected: IPV6_HEADER_LEN, actual: raw.len() });
            }
            raw[8..24].copy_from_slice(&addr.octets());
            fixup_transport_checksum(raw, parsed, IPV6_HEADER_LEN)
        }
        _ => Err(NetstackError::Unsupported("address family mismatch".into())),
    }
}

fn fixup_transport_checksum(raw: &mut [u8], parsed: &ParsedPacket, header_len: usize) -> Result<()> {
    let cksum_at = match parsed.protocol {
        IpProtocol::Tcp if parsed.frag_offset == 0 => Some(16),
        IpProtocol::Udp if parsed.frag_offset == 0 => Some(6),
        _ => None,
    };
    let Some(offset) = cksum_at else { return Ok(()) };

    let start = header_len;
    if raw.len() < start + offset + 2 {
        return Ok(());
    }
    raw[start + offset..start + offset + 2].copy_from_slice(&[0, 0]);

    let proto: u8 = parsed.protocol.into();
    let cksum = match parsed.version {
        IpVersion::Ipv4 => {
            let src: [u8; 4] = raw[12..16].try_into().unwrap();
            let dst: [u8; 4] = raw[16..20].try_into().unwrap();
            transport_checksum_v4(&src, &dst, proto, &raw[start..])
        }
        IpVersion::Ipv6 => {
            let src: [u8; 16] = raw[8..24].try_into().unwrap();
            let dst: [u8; 16] = raw[24..40].try_into().unwrap();
            transport_checksum_v6(&src, &dst, proto, &raw[start..])
        }
    };
    let cksum = if parsed.protocol == IpProtocol::Udp && cksum == 0 { 0xFFFF } else { cksum };
    raw[start + offset..start + offset + 2].copy_from_slice(&cksum.to_be_bytes());
    Ok(())
}

fn checksum(data: &[u8]) -> u16 {
    finish_sum(sum_words(0, data))
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn finish_sum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

fn transport_checksum_v4(src: &[u8; 4], dst: &[u8; 4], proto: u8, data: &[u8]) -> u16 {
    let mut sum = sum_words(0, src);
    sum = sum_words(sum, dst);
    sum = sum.wrapping_add(proto as u32);
    sum = sum.wrapping_add(data.len() as u32);
    finish_sum(sum_words(sum, data))
}

fn transport_checksum_v6(src: &[u8; 16], dst: &[u8; 16], proto: u8, data: &[u8]) -> u16 {
    let mut sum = sum_words(0, src);
    sum = sum_words(sum, dst);
    sum = sum.wrapping_add(data.len() as u32);
    sum = sum.wrapping_add(proto as u32);
    finish_sum(sum_words(sum, data))
}
