//! Raw frame decoding.
//!
//! Turns captured bytes into a `Packet` using etherparse's sliced view,
//! one stage per layer. Application protocol detection is not done here;
//! that belongs to the stream decoders.

use etherparse::{LinkSlice, NetSlice, SlicedPacket, TransportSlice};

use crate::errors::DecodeError;

use super::layers::{
    EthernetInfo, IcmpInfo, Icmpv6Info, Ipv4Info, Ipv6Info, Layer3, Layer4,
    TcpFlags, TcpInfo, UdpInfo,
};
use super::packet::Packet;

/// Link-layer hint reported by the packet source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// DLT_EN10MB
    Ethernet,
    /// DLT_RAW / ip-over-anything
    RawIp,
}

/// Per-packet decode options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// Copy payloads for every transport
    #[default]
    Eager,
    /// Copy payloads only where downstream consumers need them (TCP);
    /// other transports keep sizes but drop bytes
    Lazy,
}

/// Decode a raw frame into a `Packet`.
///
/// Packets with an unknown or truncated link layer fail with
/// `DecodeError::BadLayer`; missing upper layers are represented as
/// `None` so a link-only frame still produces a packet.
pub fn decode_packet(
    data: &[u8],
    link: LinkType,
    ts: i64,
    cap_len: u32,
    wire_len: u32,
    mode: DecodeMode,
    verify_checksums: bool,
) -> Result<Packet, DecodeError> {
    let sliced = match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data),
        LinkType::RawIp => SlicedPacket::from_ip(data),
    }
    .map_err(|e| DecodeError::BadLayer {
        layer: "link",
        reason: e.to_string(),
    })?;

    let ethernet = match &sliced.link {
        Some(LinkSlice::Ethernet2(eth)) => Some(EthernetInfo {
            src_mac: eth.source(),
            dst_mac: eth.destination(),
            ethertype: eth.ether_type().0,
        }),
        _ => None,
    };

    let layer3 = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            if verify_checksums && !checksum_ok(header.slice()) {
                return Err(DecodeError::Checksum { layer: "IPv4" });
            }
            Some(Layer3::Ipv4(Ipv4Info {
                src_addr: header.source_addr(),
                dst_addr: header.destination_addr(),
                protocol: header.protocol().0,
                ttl: header.ttl(),
                identification: header.identification(),
                fragment_offset: header.fragments_offset().value(),
                more_fragments: header.more_fragments(),
                dont_fragment: header.dont_fragment(),
                total_length: header.total_len(),
            }))
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            Some(Layer3::Ipv6(Ipv6Info {
                src_addr: header.source_addr(),
                dst_addr: header.destination_addr(),
                next_header: header.next_header().0,
                hop_limit: header.hop_limit(),
                payload_length: header.payload_length(),
                flow_label: header.flow_label().value(),
            }))
        }
        _ => None,
    };

    let layer4 = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            // the segment itself decodes either way; the verdict rides
            // along so the reassembler can refuse admission
            let checksum_valid = if verify_checksums {
                sliced
                    .net
                    .as_ref()
                    .map(|net| tcp_checksum_ok(net, tcp.slice()))
                    .unwrap_or(true)
            } else {
                true
            };
            Some(Layer4::Tcp(TcpInfo {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                window: tcp.window_size(),
                flags: TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                    ece: tcp.ece(),
                    cwr: tcp.cwr(),
                },
                checksum_valid,
                payload: tcp.payload().to_vec(),
            }))
        }
        Some(TransportSlice::Udp(udp)) => Some(Layer4::Udp(UdpInfo {
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            length: udp.length(),
            payload: copy_payload(udp.payload(), mode),
        })),
        Some(TransportSlice::Icmpv4(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, code) = if bytes.len() >= 2 {
                (bytes[0], bytes[1])
            } else {
                (0, 0)
            };
            Some(Layer4::Icmp(IcmpInfo {
                icmp_type,
                code,
                payload: copy_payload(icmp.payload(), mode),
            }))
        }
        Some(TransportSlice::Icmpv6(icmp)) => {
            let bytes = icmp.slice();
            let (icmp_type, code) = if bytes.len() >= 2 {
                (bytes[0], bytes[1])
            } else {
                (0, 0)
            };
            Some(Layer4::Icmpv6(Icmpv6Info {
                icmp_type,
                code,
                payload: copy_payload(icmp.payload(), mode),
            }))
        }
        // unhandled IP protocols carry no transport layer
        None => None,
    };

    // A frame with neither link nor network layer carries nothing usable
    if ethernet.is_none() && layer3.is_none() {
        return Err(DecodeError::BadLayer {
            layer: "link",
            reason: "no decodable layers".into(),
        });
    }

    Ok(Packet {
        ts,
        cap_len,
        wire_len,
        ethernet,
        layer3,
        layer4,
    })
}

fn copy_payload(payload: &[u8], mode: DecodeMode) -> Vec<u8> {
    match mode {
        DecodeMode::Eager => payload.to_vec(),
        DecodeMode::Lazy => Vec::new(),
    }
}

/// Ones' complement sum of a byte slice, an odd tail padded with zero.
fn ones_sum(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum over a header slice: a valid header sums to 0xffff.
fn checksum_ok(header: &[u8]) -> bool {
    fold(ones_sum(header, 0)) == 0xffff
}

/// Verify a TCP checksum. `segment` covers the TCP header and payload;
/// the pseudo header is derived from the enclosing network layer.
fn tcp_checksum_ok(net: &NetSlice<'_>, segment: &[u8]) -> bool {
    let mut sum = ones_sum(segment, 0);
    match net {
        NetSlice::Ipv4(ipv4) => {
            let header = ipv4.header();
            sum = ones_sum(&header.source_addr().octets(), sum);
            sum = ones_sum(&header.destination_addr().octets(), sum);
        }
        NetSlice::Ipv6(ipv6) => {
            let header = ipv6.header();
            sum = ones_sum(&header.source_addr().octets(), sum);
            sum = ones_sum(&header.destination_addr().octets(), sum);
        }
    }
    // zero-padded protocol number and upper-layer length words
    sum += 6;
    sum += segment.len() as u32;
    fold(sum) == 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    #[test]
    fn test_decode_tcp_packet() {
        let builder = PacketBuilder::ethernet2(
            [0, 1, 2, 3, 4, 5],
            [6, 7, 8, 9, 10, 11],
        )
        .ipv4([192, 168, 1, 100], [10, 0, 0, 1], 64)
        .tcp(54321, 110, 1000, 8192);

        let payload = b"USER alice\r\n";
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, payload).unwrap();

        let len = data.len() as u32;
        let pkt = decode_packet(
            &data,
            LinkType::Ethernet,
            42,
            len,
            len,
            DecodeMode::Eager,
            true,
        )
        .unwrap();

        assert_eq!(pkt.ts, 42);
        assert_eq!(pkt.src_port(), 54321);
        assert_eq!(pkt.dst_port(), 110);
        assert_eq!(pkt.app_payload(), payload);
        assert!(pkt.is_tcp());
        assert_eq!(
            pkt.ethernet.as_ref().unwrap().src_string(),
            "00:01:02:03:04:05"
        );
    }

    #[test]
    fn test_decode_icmp_packet() {
        let builder = PacketBuilder::ethernet2(
            [0, 1, 2, 3, 4, 5],
            [6, 7, 8, 9, 10, 11],
        )
        .ipv4([192, 168, 1, 100], [10, 0, 0, 1], 64)
        .icmpv4_echo_request(7, 1);

        let mut data = Vec::with_capacity(builder.size(0));
        builder.write(&mut data, &[]).unwrap();

        let len = data.len() as u32;
        let pkt = decode_packet(
            &data,
            LinkType::Ethernet,
            0,
            len,
            len,
            DecodeMode::Eager,
            false,
        )
        .unwrap();

        assert!(!pkt.is_tcp());
        assert_eq!(
            pkt.layer4.as_ref().unwrap().proto_name(),
            "ICMPv4"
        );
        assert_eq!(pkt.layer3.as_ref().unwrap().proto_name(), "IPv4");
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_packet(
            &[0u8; 4],
            LinkType::Ethernet,
            0,
            4,
            4,
            DecodeMode::Eager,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_tcp_checksum_verdict() {
        let builder = PacketBuilder::ethernet2(
            [0, 1, 2, 3, 4, 5],
            [6, 7, 8, 9, 10, 11],
        )
        .ipv4([192, 168, 1, 100], [10, 0, 0, 1], 64)
        .tcp(54321, 110, 1000, 8192);

        let mut data = Vec::new();
        builder.write(&mut data, b"RETR 1\r\n").unwrap();
        let len = data.len() as u32;

        // the builder fills in a correct checksum
        let pkt = decode_packet(
            &data,
            LinkType::Ethernet,
            0,
            len,
            len,
            DecodeMode::Eager,
            true,
        )
        .unwrap();
        assert!(pkt.tcp().unwrap().checksum_valid);

        // flipping a payload byte invalidates it
        let end = data.len() - 1;
        data[end] ^= 0xff;
        let pkt = decode_packet(
            &data,
            LinkType::Ethernet,
            0,
            len,
            len,
            DecodeMode::Eager,
            true,
        )
        .unwrap();
        assert!(!pkt.tcp().unwrap().checksum_valid);

        // with verification off the verdict stays clean
        let pkt = decode_packet(
            &data,
            LinkType::Ethernet,
            0,
            len,
            len,
            DecodeMode::Eager,
            false,
        )
        .unwrap();
        assert!(pkt.tcp().unwrap().checksum_valid);
    }

    #[test]
    fn test_checksum_ok() {
        // RFC 1071 worked example header
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11,
            0xb8, 0x61, 0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert!(checksum_ok(&header));

        let mut bad = header;
        bad[10] = 0;
        bad[11] = 0;
        assert!(!checksum_ok(&bad));
    }
}
