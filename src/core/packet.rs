//! Unified packet representation.
//!
//! A `Packet` is transient: created by the source, consumed by the
//! decoders, dropped after dispatch. It carries the capture timestamp in
//! nanoseconds, the captured and original wire lengths, and the parsed
//! layers. Flow hashes are derived on demand from the layer endpoints.

use std::net::IpAddr;

use super::layers::{EthernetInfo, Layer3, Layer4};

/// Directional flow key: one 64-bit hash per layer, in capture direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub link: u64,
    pub network: u64,
    pub transport: u64,
}

/// Canonical bidirectional connection key.
///
/// A fixed 24-byte value: the three order-independent layer hashes,
/// big-endian concatenated. Both directions of a connection map to the
/// same key because each layer hash is computed over the
/// lexicographically sorted endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(pub [u8; 24]);

impl ConnectionKey {
    pub fn as_bytes(&self) -> &[u8; 24] {
        &self.0
    }
}

/// A decoded packet, valid for the duration of one dispatch.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp in nanoseconds since the epoch
    pub ts: i64,
    /// Bytes captured off the wire
    pub cap_len: u32,
    /// Original wire length (may exceed cap_len with a short snaplen)
    pub wire_len: u32,
    /// Link layer
    pub ethernet: Option<EthernetInfo>,
    /// Network layer
    pub layer3: Option<Layer3>,
    /// Transport layer
    pub layer4: Option<Layer4>,
}

impl Packet {
    pub fn src_ip(&self) -> Option<IpAddr> {
        self.layer3.as_ref().map(|l3| l3.src_ip())
    }

    pub fn dst_ip(&self) -> Option<IpAddr> {
        self.layer3.as_ref().map(|l3| l3.dst_ip())
    }

    pub fn src_port(&self) -> u16 {
        self.layer4.as_ref().map(|l4| l4.src_port()).unwrap_or(0)
    }

    pub fn dst_port(&self) -> u16 {
        self.layer4.as_ref().map(|l4| l4.dst_port()).unwrap_or(0)
    }

    /// Application payload above the transport layer (empty if none)
    pub fn app_payload(&self) -> &[u8] {
        self.layer4.as_ref().map(|l4| l4.payload()).unwrap_or(&[])
    }

    /// Application layer protocol name, derived from payload presence
    pub fn app_proto_name(&self) -> &'static str {
        if self.app_payload().is_empty() {
            ""
        } else {
            "Payload"
        }
    }

    pub fn tcp(&self) -> Option<&super::layers::TcpInfo> {
        self.layer4.as_ref().and_then(|l4| l4.as_tcp())
    }

    pub fn is_tcp(&self) -> bool {
        self.layer4.as_ref().map(|l4| l4.is_tcp()).unwrap_or(false)
    }

    /// Directional per-layer flow hashes, in capture direction.
    ///
    /// Layers that are absent hash to 0 so that packets missing a layer
    /// still produce a stable key.
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            link: self
                .ethernet
                .as_ref()
                .map(|e| flow_hash(0x4c, &e.src_mac, &e.dst_mac))
                .unwrap_or(0),
            network: self
                .layer3
                .as_ref()
                .map(|l3| flow_hash(0x4e, &l3.src_bytes(), &l3.dst_bytes()))
                .unwrap_or(0),
            transport: self
                .layer4
                .as_ref()
                .and_then(|l4| l4.flow_endpoints())
                .map(|(src, dst)| flow_hash(0x54, &src, &dst))
                .unwrap_or(0),
        }
    }

    /// Canonical bidirectional connection key (24 bytes, fixed width).
    pub fn connection_key(&self) -> ConnectionKey {
        let link = self
            .ethernet
            .as_ref()
            .map(|e| canonical_hash(0x4c, &e.src_mac, &e.dst_mac))
            .unwrap_or(0);
        let network = self
            .layer3
            .as_ref()
            .map(|l3| canonical_hash(0x4e, &l3.src_bytes(), &l3.dst_bytes()))
            .unwrap_or(0);
        let transport = self
            .layer4
            .as_ref()
            .and_then(|l4| l4.flow_endpoints())
            .map(|(src, dst)| canonical_hash(0x54, &src, &dst))
            .unwrap_or(0);

        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&link.to_be_bytes());
        key[8..16].copy_from_slice(&network.to_be_bytes());
        key[16..].copy_from_slice(&transport.to_be_bytes());
        ConnectionKey(key)
    }

    /// Canonical network-layer hash, used as the worker shard key so that
    /// both directions of a flow land on the same worker.
    pub fn shard_hash(&self) -> u64 {
        if let Some(l3) = &self.layer3 {
            canonical_hash(0x4e, &l3.src_bytes(), &l3.dst_bytes())
        } else if let Some(eth) = &self.ethernet {
            canonical_hash(0x4c, &eth.src_mac, &eth.dst_mac)
        } else {
            0
        }
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a over a layer salt and the endpoint pair in capture order.
/// Stable across runs, unlike the std hasher.
fn flow_hash(salt: u8, src: &[u8], dst: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in std::iter::once(&salt).chain(src).chain(dst) {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Same hash over the lexicographically sorted endpoint pair, so both
/// directions agree.
fn canonical_hash(salt: u8, a: &[u8], b: &[u8]) -> u64 {
    if a <= b {
        flow_hash(salt, a, b)
    } else {
        flow_hash(salt, b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::layers::{Ipv4Info, TcpInfo};
    use std::net::Ipv4Addr;

    fn tcp_packet(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    ) -> Packet {
        Packet {
            ts: 1_000,
            cap_len: 64,
            wire_len: 64,
            ethernet: None,
            layer3: Some(Layer3::Ipv4(Ipv4Info {
                src_addr: src,
                dst_addr: dst,
                protocol: 6,
                ..Default::default()
            })),
            layer4: Some(Layer4::Tcp(TcpInfo {
                src_port,
                dst_port,
                ..Default::default()
            })),
        }
    }

    #[test]
    fn test_connection_key_direction_independent() {
        let a = Ipv4Addr::new(192, 168, 1, 100);
        let b = Ipv4Addr::new(10, 0, 0, 1);
        let fwd = tcp_packet(a, b, 54321, 110);
        let rev = tcp_packet(b, a, 110, 54321);

        assert_eq!(fwd.connection_key(), rev.connection_key());
        assert_ne!(fwd.flow_key(), rev.flow_key());
    }

    #[test]
    fn test_shard_hash_direction_independent() {
        let a = Ipv4Addr::new(192, 168, 1, 100);
        let b = Ipv4Addr::new(10, 0, 0, 1);
        let fwd = tcp_packet(a, b, 54321, 110);
        let rev = tcp_packet(b, a, 110, 54321);
        assert_eq!(fwd.shard_hash(), rev.shard_hash());
    }

    #[test]
    fn test_distinct_flows_distinct_keys() {
        let a = Ipv4Addr::new(192, 168, 1, 100);
        let b = Ipv4Addr::new(10, 0, 0, 1);
        let one = tcp_packet(a, b, 54321, 110);
        let two = tcp_packet(a, b, 54322, 110);
        assert_ne!(one.connection_key(), two.connection_key());
    }

    #[test]
    fn test_missing_layers_hash_to_zero() {
        let pkt = Packet {
            ts: 0,
            cap_len: 40,
            wire_len: 40,
            ethernet: None,
            layer3: None,
            layer4: None,
        };
        let key = pkt.flow_key();
        assert_eq!(key.link, 0);
        assert_eq!(key.network, 0);
        assert_eq!(key.transport, 0);
        assert_eq!(pkt.shard_hash(), 0);
    }
}
