//! Strongly-typed network layer structs.
//!
//! - Layer 2: Ethernet (`EthernetInfo`)
//! - Layer 3: IPv4, IPv6 (`Layer3`)
//! - Layer 4: TCP, UDP, ICMP, ICMPv6 (`Layer4`)
//!
//! Each layer exposes its endpoints both as display strings (for audit
//! records) and as raw bytes (for flow hashing).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

// ============================================================================
// Layer 2 - Data Link
// ============================================================================

/// Ethernet frame information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EthernetInfo {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ethertype: u16,
}

impl EthernetInfo {
    pub fn src_string(&self) -> String {
        format_mac(&self.src_mac)
    }

    pub fn dst_string(&self) -> String {
        format_mac(&self.dst_mac)
    }
}

/// Format a MAC address as lowercase colon-separated hex
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

// ============================================================================
// Layer 3 - Network
// ============================================================================

/// Layer 3 protocol variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer3 {
    Ipv4(Ipv4Info),
    Ipv6(Ipv6Info),
}

impl Layer3 {
    /// Both addresses of this layer, sender first.
    pub fn addrs(&self) -> (IpAddr, IpAddr) {
        match self {
            Layer3::Ipv4(v4) => (v4.src_addr.into(), v4.dst_addr.into()),
            Layer3::Ipv6(v6) => (v6.src_addr.into(), v6.dst_addr.into()),
        }
    }

    /// Address the packet came from
    pub fn src_ip(&self) -> IpAddr {
        self.addrs().0
    }

    /// Address the packet is headed to
    pub fn dst_ip(&self) -> IpAddr {
        self.addrs().1
    }

    /// IANA number of the carried protocol: the v4 protocol field, or
    /// the v6 next-header field
    pub fn protocol(&self) -> u8 {
        match self {
            Layer3::Ipv4(v4) => v4.protocol,
            Layer3::Ipv6(v6) => v6.next_header,
        }
    }

    /// Layer type name as it appears in audit records
    pub fn proto_name(&self) -> &'static str {
        match self {
            Layer3::Ipv4(_) => "IPv4",
            Layer3::Ipv6(_) => "IPv6",
        }
    }

    /// Source endpoint bytes for flow hashing
    pub fn src_bytes(&self) -> Vec<u8> {
        match self {
            Layer3::Ipv4(info) => info.src_addr.octets().to_vec(),
            Layer3::Ipv6(info) => info.src_addr.octets().to_vec(),
        }
    }

    /// Destination endpoint bytes for flow hashing
    pub fn dst_bytes(&self) -> Vec<u8> {
        match self {
            Layer3::Ipv4(info) => info.dst_addr.octets().to_vec(),
            Layer3::Ipv6(info) => info.dst_addr.octets().to_vec(),
        }
    }
}

/// IPv4 header information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv4Info {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub identification: u16,
    pub fragment_offset: u16,
    pub more_fragments: bool,
    pub dont_fragment: bool,
    pub total_length: u16,
}

impl Default for Ipv4Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            protocol: 0,
            ttl: 64,
            identification: 0,
            fragment_offset: 0,
            more_fragments: false,
            dont_fragment: false,
            total_length: 0,
        }
    }
}

/// IPv6 header information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Info {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub next_header: u8,
    pub hop_limit: u8,
    pub payload_length: u16,
    pub flow_label: u32,
}

impl Default for Ipv6Info {
    fn default() -> Self {
        Self {
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            next_header: 0,
            hop_limit: 64,
            payload_length: 0,
            flow_label: 0,
        }
    }
}

// ============================================================================
// Layer 4 - Transport
// ============================================================================

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    /// First packet of a handshake: SYN on its own
    pub fn is_syn(&self) -> bool {
        matches!((self.syn, self.ack), (true, false))
    }

    /// Second packet of a handshake: SYN and ACK together
    pub fn is_syn_ack(&self) -> bool {
        matches!((self.syn, self.ack), (true, true))
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn {
            s.push('S');
        }
        if self.ack {
            s.push('A');
        }
        if self.fin {
            s.push('F');
        }
        if self.rst {
            s.push('R');
        }
        if self.psh {
            s.push('P');
        }
        if self.urg {
            s.push('U');
        }
        if s.is_empty() {
            s.push('.');
        }
        write!(f, "{}", s)
    }
}

/// TCP segment information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: TcpFlags,
    /// Verdict of the transport checksum verification, decided while
    /// decoding. Stays true when verification is disabled; the
    /// reassembler rejects segments where it is false.
    pub checksum_valid: bool,
    pub payload: Vec<u8>,
}

impl Default for TcpInfo {
    fn default() -> Self {
        Self {
            src_port: 0,
            dst_port: 0,
            seq: 0,
            ack: 0,
            window: 0,
            flags: TcpFlags::default(),
            checksum_valid: true,
            payload: Vec::new(),
        }
    }
}

/// UDP datagram information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub payload: Vec<u8>,
}

/// ICMP message information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IcmpInfo {
    pub icmp_type: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

/// ICMPv6 message information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Icmpv6Info {
    pub icmp_type: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

/// Layer 4 protocol variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer4 {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp(IcmpInfo),
    Icmpv6(Icmpv6Info),
}

impl Layer4 {
    /// Layer type name as it appears in audit records
    pub fn proto_name(&self) -> &'static str {
        match self {
            Layer4::Tcp(_) => "TCP",
            Layer4::Udp(_) => "UDP",
            Layer4::Icmp(_) => "ICMPv4",
            Layer4::Icmpv6(_) => "ICMPv6",
        }
    }

    /// Get source port (0 for portless protocols)
    pub fn src_port(&self) -> u16 {
        match self {
            Layer4::Tcp(t) => t.src_port,
            Layer4::Udp(u) => u.src_port,
            _ => 0,
        }
    }

    /// Get destination port (0 for portless protocols)
    pub fn dst_port(&self) -> u16 {
        match self {
            Layer4::Tcp(t) => t.dst_port,
            Layer4::Udp(u) => u.dst_port,
            _ => 0,
        }
    }

    /// Application payload carried above this layer
    pub fn payload(&self) -> &[u8] {
        match self {
            Layer4::Tcp(t) => &t.payload,
            Layer4::Udp(u) => &u.payload,
            Layer4::Icmp(i) => &i.payload,
            Layer4::Icmpv6(i) => &i.payload,
        }
    }

    /// Flow endpoint bytes for hashing. Portless protocols carry no
    /// transport flow of their own: an ICMP echo pair belongs to one
    /// bidirectional connection regardless of type/code.
    pub fn flow_endpoints(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        match self {
            Layer4::Tcp(t) => Some((
                t.src_port.to_be_bytes().to_vec(),
                t.dst_port.to_be_bytes().to_vec(),
            )),
            Layer4::Udp(u) => Some((
                u.src_port.to_be_bytes().to_vec(),
                u.dst_port.to_be_bytes().to_vec(),
            )),
            Layer4::Icmp(_) | Layer4::Icmpv6(_) => None,
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpInfo> {
        match self {
            Layer4::Tcp(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Layer4::Tcp(_))
    }
}
