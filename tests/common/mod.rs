//! Shared helpers for the end-to-end pipeline tests: a minimal classic
//! pcap writer and a TCP session scripter built on etherparse.

use std::fs::File;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use etherparse::PacketBuilder;

pub const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

/// One captured frame: (seconds, microseconds, bytes).
pub type Frame = (u32, u32, Vec<u8>);

/// Write a classic little-endian pcap file (linktype 1, microseconds).
pub fn write_pcap(path: &Path, frames: &[Frame]) {
    let mut f = File::create(path).unwrap();
    f.write_all(&0xa1b2c3d4u32.to_le_bytes()).unwrap();
    f.write_all(&2u16.to_le_bytes()).unwrap();
    f.write_all(&4u16.to_le_bytes()).unwrap();
    f.write_all(&0u32.to_le_bytes()).unwrap();
    f.write_all(&0u32.to_le_bytes()).unwrap();
    f.write_all(&65535u32.to_le_bytes()).unwrap();
    f.write_all(&1u32.to_le_bytes()).unwrap();
    for (sec, usec, data) in frames {
        f.write_all(&sec.to_le_bytes()).unwrap();
        f.write_all(&usec.to_le_bytes()).unwrap();
        f.write_all(&(data.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&(data.len() as u32).to_le_bytes()).unwrap();
        f.write_all(data).unwrap();
    }
}

/// Scripts one TCP connection packet by packet with consistent sequence
/// numbers and timestamps.
pub struct TcpSession {
    pub client: (Ipv4Addr, u16),
    pub server: (Ipv4Addr, u16),
    cseq: u32,
    sseq: u32,
    clock_us: u64,
    pub frames: Vec<Frame>,
}

impl TcpSession {
    pub fn new(client: (Ipv4Addr, u16), server: (Ipv4Addr, u16)) -> Self {
        Self {
            client,
            server,
            cseq: 1_000,
            sseq: 5_000,
            clock_us: 1_600_000_000_000_000,
            frames: Vec::new(),
        }
    }

    fn tick(&mut self) -> (u32, u32) {
        self.clock_us += 100;
        (
            (self.clock_us / 1_000_000) as u32,
            (self.clock_us % 1_000_000) as u32,
        )
    }

    pub fn handshake(&mut self) {
        let syn = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
            .ipv4(self.client.0.octets(), self.server.0.octets(), 64)
            .tcp(self.client.1, self.server.1, self.cseq, 8192)
            .syn();
        self.push(syn, &[]);
        self.cseq = self.cseq.wrapping_add(1);

        let syn_ack = PacketBuilder::ethernet2(SERVER_MAC, CLIENT_MAC)
            .ipv4(self.server.0.octets(), self.client.0.octets(), 64)
            .tcp(self.server.1, self.client.1, self.sseq, 8192)
            .syn()
            .ack(self.cseq);
        self.push(syn_ack, &[]);
        self.sseq = self.sseq.wrapping_add(1);

        let ack = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
            .ipv4(self.client.0.octets(), self.server.0.octets(), 64)
            .tcp(self.client.1, self.server.1, self.cseq, 8192)
            .ack(self.sseq);
        self.push(ack, &[]);
    }

    pub fn client_send(&mut self, data: &[u8]) {
        let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
            .ipv4(self.client.0.octets(), self.server.0.octets(), 64)
            .tcp(self.client.1, self.server.1, self.cseq, 8192)
            .ack(self.sseq);
        self.push(builder, data);
        self.cseq = self.cseq.wrapping_add(data.len() as u32);
    }

    pub fn server_send(&mut self, data: &[u8]) {
        let builder = PacketBuilder::ethernet2(SERVER_MAC, CLIENT_MAC)
            .ipv4(self.server.0.octets(), self.client.0.octets(), 64)
            .tcp(self.server.1, self.client.1, self.sseq, 8192)
            .ack(self.cseq);
        self.push(builder, data);
        self.sseq = self.sseq.wrapping_add(data.len() as u32);
    }

    /// FIN from the client, then FIN from the server.
    pub fn finish(&mut self) {
        let fin_c = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
            .ipv4(self.client.0.octets(), self.server.0.octets(), 64)
            .tcp(self.client.1, self.server.1, self.cseq, 8192)
            .fin()
            .ack(self.sseq);
        self.push(fin_c, &[]);
        self.cseq = self.cseq.wrapping_add(1);

        let fin_s = PacketBuilder::ethernet2(SERVER_MAC, CLIENT_MAC)
            .ipv4(self.server.0.octets(), self.client.0.octets(), 64)
            .tcp(self.server.1, self.client.1, self.sseq, 8192)
            .fin()
            .ack(self.cseq);
        self.push(fin_s, &[]);
        self.sseq = self.sseq.wrapping_add(1);
    }

    fn push(
        &mut self,
        builder: etherparse::PacketBuilderStep<etherparse::TcpHeader>,
        payload: &[u8],
    ) {
        let mut bytes = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut bytes, payload).unwrap();
        let (sec, usec) = self.tick();
        self.frames.push((sec, usec, bytes));
    }
}

/// Parse a newline-delimited JSON audit file: the header line followed
/// by the records. Returns an empty vector when the file was removed by
/// the empty-file policy.
pub fn read_records(dir: &Path, file: &str) -> Vec<serde_json::Value> {
    let path = dir.join(file);
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    content
        .lines()
        .skip(1)
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
