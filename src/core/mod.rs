//! Core shared types for the packet-to-audit-record pipeline.
//!
//! - `layers`: strongly-typed network layer structs
//! - `packet`: unified packet representation and flow keys
//! - `parse`: raw frame decoding via etherparse
//! - `records`: the audit record model

pub mod layers;
pub mod packet;
pub mod parse;
pub mod records;

pub use layers::{
    format_mac, EthernetInfo, IcmpInfo, Icmpv6Info, Ipv4Info, Ipv6Info,
    Layer3, Layer4, TcpFlags, TcpInfo, UdpInfo,
};
pub use packet::{ConnectionKey, FlowKey, Packet};
pub use parse::{decode_packet, DecodeMode, LinkType};
pub use records::{
    ConnectionRecord, FileRecord, FlowRecord, Header, MailMessage,
    PacketContext, Pop3Record, Record, RecordStats, RecordType,
};

/// MD5 digest as lowercase hex, used for connection UIDs and file hashes.
pub fn md5_hex(input: &[u8]) -> String {
    format!("{:x}", md5::compute(input))
}

/// Shannon entropy of a byte histogram, in bits per byte.
pub fn entropy_from_histogram(hist: &[u64; 256], total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let mut h = 0.0;
    for &count in hist.iter() {
        if count == 0 {
            continue;
        }
        let p = count as f64 / total as f64;
        h -= p * p.log2();
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_hex() {
        // RFC 1321 test vector
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_entropy() {
        let mut hist = [0u64; 256];
        hist[0] = 100;
        assert_eq!(entropy_from_histogram(&hist, 100), 0.0);

        let mut uniform = [0u64; 256];
        for slot in uniform.iter_mut() {
            *slot = 1;
        }
        let h = entropy_from_histogram(&uniform, 256);
        assert!((h - 8.0).abs() < 1e-9);
    }
}
