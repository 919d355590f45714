//! Connection tracker.
//!
//! Maintains the table of bidirectional connections keyed by the
//! canonical 24-byte key. Every packet updates counters, timestamps and
//! direction under a per-entry lock; records are emitted only on idle
//! flush or at shutdown, exactly once per key.
//!
//! Locking discipline: the table lock covers lookup and insert and is
//! released before the per-entry lock is taken for field updates. No
//! lock is held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::packet::{ConnectionKey, Packet};
use crate::core::records::{ConnectionRecord, Record, RecordType};
use crate::core::{entropy_from_histogram, md5_hex};
use crate::resolver::Resolver;

use super::PacketDecoder;

/// Parent-connection metadata exposed to stream readers through their
/// 64-bit handle, replacing a direct back-reference.
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    pub timestamp_first: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
}

struct ConnState {
    first_ts: i64,
    last_ts: i64,
    src_mac: String,
    dst_mac: String,
    src_ip: String,
    dst_ip: String,
    src_port: String,
    dst_port: String,
    dst_port_num: u16,
    link_proto: String,
    network_proto: String,
    transport_proto: String,
    application_proto: String,
    num_packets: u64,
    total_size: u64,
    app_payload_size: u64,
    /// Byte histogram of the app payload, kept only when entropy
    /// calculation is enabled
    hist: Option<Box<[u64; 256]>>,
}

impl ConnState {
    fn from_packet(pkt: &Packet, entropy: bool) -> Self {
        let mut state = Self {
            first_ts: pkt.ts,
            last_ts: pkt.ts,
            src_mac: String::new(),
            dst_mac: String::new(),
            src_ip: String::new(),
            dst_ip: String::new(),
            src_port: String::new(),
            dst_port: String::new(),
            dst_port_num: 0,
            link_proto: String::new(),
            network_proto: String::new(),
            transport_proto: String::new(),
            application_proto: String::new(),
            num_packets: 1,
            total_size: pkt.wire_len as u64,
            app_payload_size: pkt.app_payload().len() as u64,
            hist: entropy.then(|| Box::new([0u64; 256])),
        };
        state.set_endpoints(pkt);
        state.set_protos(pkt);
        state.count_payload(pkt);
        state
    }

    /// Src*/Dst* describe the endpoint that sent the earliest packet.
    fn set_endpoints(&mut self, pkt: &Packet) {
        if let Some(eth) = &pkt.ethernet {
            self.src_mac = eth.src_string();
            self.dst_mac = eth.dst_string();
        }
        if let Some(l3) = &pkt.layer3 {
            self.src_ip = l3.src_ip().to_string();
            self.dst_ip = l3.dst_ip().to_string();
        }
        if let Some(l4) = &pkt.layer4 {
            let src = l4.src_port();
            let dst = l4.dst_port();
            if src != 0 || dst != 0 {
                self.src_port = src.to_string();
                self.dst_port = dst.to_string();
                self.dst_port_num = dst;
            }
        }
    }

    fn set_protos(&mut self, pkt: &Packet) {
        if pkt.ethernet.is_some() {
            self.link_proto = "Ethernet".to_string();
        }
        if let Some(l3) = &pkt.layer3 {
            self.network_proto = l3.proto_name().to_string();
        }
        if let Some(l4) = &pkt.layer4 {
            self.transport_proto = l4.proto_name().to_string();
        }
        if !pkt.app_payload().is_empty() {
            self.application_proto = pkt.app_proto_name().to_string();
        }
    }

    fn count_payload(&mut self, pkt: &Packet) {
        if let Some(hist) = self.hist.as_deref_mut() {
            for &b in pkt.app_payload() {
                hist[b as usize] += 1;
            }
        }
    }

    fn update(&mut self, pkt: &Packet) {
        // an earlier capture timestamp rewrites the connection direction:
        // the first packet decides src and dst
        if pkt.ts < self.first_ts {
            self.first_ts = pkt.ts;
            self.set_endpoints(pkt);
        }
        if pkt.ts > self.last_ts {
            self.last_ts = pkt.ts;
        }
        self.num_packets += 1;
        self.total_size += pkt.wire_len as u64;
        self.app_payload_size += pkt.app_payload().len() as u64;
        if self.application_proto.is_empty() && !pkt.app_payload().is_empty()
        {
            self.application_proto = pkt.app_proto_name().to_string();
        }
        self.count_payload(pkt);
    }
}

struct ConnEntry {
    handle: u64,
    key: ConnectionKey,
    state: Mutex<ConnState>,
}

/// The shared connection table.
pub struct ConnectionTracker {
    table: Mutex<HashMap<ConnectionKey, Arc<ConnEntry>>>,
    handles: RwLock<HashMap<u64, Arc<ConnEntry>>>,
    next_handle: AtomicU64,
    timeout_ns: i64,
    entropy: bool,
    resolver: Arc<Resolver>,
}

impl ConnectionTracker {
    pub fn new(timeout_ns: i64, entropy: bool, resolver: Arc<Resolver>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            timeout_ns,
            entropy,
            resolver,
        }
    }

    /// Process one packet: insert or update its connection entry.
    /// Returns the entry's handle.
    pub fn update(&self, pkt: &Packet) -> u64 {
        let key = pkt.connection_key();

        let entry = {
            let mut table = self.table.lock();
            if let Some(entry) = table.get(&key) {
                let entry = entry.clone();
                drop(table);
                entry.state.lock().update(pkt);
                return entry.handle;
            }

            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(ConnEntry {
                handle,
                key,
                state: Mutex::new(ConnState::from_packet(pkt, self.entropy)),
            });
            table.insert(key, entry.clone());
            entry
        };

        self.handles.write().insert(entry.handle, entry.clone());
        entry.handle
    }

    /// Handle of the connection a packet belongs to, if tracked.
    pub fn handle_for(&self, pkt: &Packet) -> Option<u64> {
        self.table
            .lock()
            .get(&pkt.connection_key())
            .map(|entry| entry.handle)
    }

    /// Parent metadata for a stream reader's handle.
    pub fn meta(&self, handle: u64) -> Option<ConnMeta> {
        let entry = self.handles.read().get(&handle)?.clone();
        let state = entry.state.lock();
        Some(ConnMeta {
            timestamp_first: state.first_ts,
            src_ip: state.src_ip.clone(),
            dst_ip: state.dst_ip.clone(),
            src_port: state.src_port.clone(),
            dst_port: state.dst_port.clone(),
        })
    }

    pub fn active(&self) -> usize {
        self.table.lock().len()
    }

    fn drain<F>(&self, predicate: F) -> Vec<Arc<ConnEntry>>
    where
        F: Fn(&ConnEntry) -> bool,
    {
        let mut table = self.table.lock();
        let keys: Vec<ConnectionKey> = table
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| *key)
            .collect();

        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = table.remove(&key) {
                drained.push(entry);
            }
        }
        drop(table);

        let mut handles = self.handles.write();
        for entry in &drained {
            handles.remove(&entry.handle);
        }
        drained
    }

    fn to_record(&self, entry: &ConnEntry) -> Record {
        let state = entry.state.lock();
        let service = if state.dst_port_num != 0 {
            self.resolver
                .service(
                    state.dst_port_num,
                    &state.transport_proto.to_lowercase(),
                )
                .unwrap_or("")
                .to_string()
        } else {
            String::new()
        };
        let entropy = state
            .hist
            .as_deref()
            .map(|hist| entropy_from_histogram(hist, state.app_payload_size))
            .unwrap_or(0.0);

        Record::Connection(ConnectionRecord {
            timestamp_first: state.first_ts,
            timestamp_last: state.last_ts,
            duration: state.last_ts - state.first_ts,
            uid: md5_hex(entry.key.as_bytes()),
            src_mac: state.src_mac.clone(),
            dst_mac: state.dst_mac.clone(),
            src_ip: state.src_ip.clone(),
            dst_ip: state.dst_ip.clone(),
            src_port: state.src_port.clone(),
            dst_port: state.dst_port.clone(),
            link_proto: state.link_proto.clone(),
            network_proto: state.network_proto.clone(),
            transport_proto: state.transport_proto.clone(),
            application_proto: state.application_proto.clone(),
            service,
            num_packets: state.num_packets,
            total_size: state.total_size,
            app_payload_size: state.app_payload_size,
            entropy,
        })
    }
}

impl PacketDecoder for ConnectionTracker {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn record_type(&self) -> RecordType {
        RecordType::Connection
    }

    fn description(&self) -> &'static str {
        "bi-directional communication between two hosts, combining the link, network and transport layer identifiers"
    }

    fn handle(&self, pkt: &Packet) -> Option<Record> {
        self.update(pkt);
        None
    }

    fn flush_idle(&self, now: i64) -> Vec<Record> {
        let timeout = self.timeout_ns;
        let drained = self.drain(|entry| {
            now.saturating_sub(entry.state.lock().last_ts) > timeout
        });
        drained.iter().map(|entry| self.to_record(entry)).collect()
    }

    fn flush_all(&self) -> Vec<Record> {
        let drained = self.drain(|_| true);
        drained.iter().map(|entry| self.to_record(entry)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::core::layers::{Ipv4Info, Layer3, Layer4, TcpInfo};
    use std::net::Ipv4Addr;

    fn tracker() -> ConnectionTracker {
        ConnectionTracker::new(
            60_000_000_000,
            false,
            Arc::new(Resolver::new(ResolverConfig::default())),
        )
    }

    fn packet(
        ts: i64,
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        wire_len: u32,
    ) -> Packet {
        Packet {
            ts,
            cap_len: wire_len,
            wire_len,
            ethernet: None,
            layer3: Some(Layer3::Ipv4(Ipv4Info {
                src_addr: Ipv4Addr::from(src),
                dst_addr: Ipv4Addr::from(dst),
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
    fn test_one_record_per_bidirectional_flow() {
        let tracker = tracker();
        tracker.handle(&packet(100, [10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, 60));
        tracker.handle(&packet(200, [10, 0, 0, 2], [10, 0, 0, 1], 80, 4000, 60));
        tracker.handle(&packet(300, [10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, 60));

        let records = tracker.flush_all();
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Connection(c) => {
                assert_eq!(c.num_packets, 3);
                assert_eq!(c.total_size, 180);
                assert_eq!(c.timestamp_first, 100);
                assert_eq!(c.timestamp_last, 300);
                assert_eq!(c.duration, 200);
                assert_eq!(c.src_ip, "10.0.0.1");
                assert_eq!(c.service, "http");
            }
            other => panic!("unexpected record {:?}", other),
        }

        // exactly once: nothing left after flush
        assert!(tracker.flush_all().is_empty());
    }

    #[test]
    fn test_out_of_order_first_packet_rewrites_direction() {
        let tracker = tracker();
        // reply captured first, request second with an earlier timestamp
        tracker.handle(&packet(500, [10, 0, 0, 2], [10, 0, 0, 1], 80, 4000, 60));
        tracker.handle(&packet(100, [10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, 60));

        let records = tracker.flush_all();
        match &records[0] {
            Record::Connection(c) => {
                assert_eq!(c.timestamp_first, 100);
                assert_eq!(c.timestamp_last, 500);
                assert_eq!(c.src_ip, "10.0.0.1");
                assert_eq!(c.src_port, "4000");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_idle_flush_removes_only_stale_entries() {
        let tracker = ConnectionTracker::new(
            1_000,
            false,
            Arc::new(Resolver::new(ResolverConfig::default())),
        );
        tracker.handle(&packet(100, [10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, 60));
        tracker.handle(&packet(5_000, [10, 0, 0, 3], [10, 0, 0, 2], 4001, 80, 60));

        let flushed = tracker.flush_idle(5_000);
        assert_eq!(flushed.len(), 1);
        assert_eq!(tracker.active(), 1);
    }

    #[test]
    fn test_meta_via_handle() {
        let tracker = tracker();
        let pkt = packet(100, [10, 0, 0, 1], [10, 0, 0, 2], 4000, 80, 60);
        let handle = tracker.update(&pkt);
        let meta = tracker.meta(handle).unwrap();
        assert_eq!(meta.src_ip, "10.0.0.1");
        assert_eq!(meta.timestamp_first, 100);
        assert!(tracker.meta(handle + 999).is_none());
    }

    #[test]
    fn test_packet_without_transport_layer() {
        let tracker = tracker();
        let mut pkt = packet(100, [10, 0, 0, 1], [10, 0, 0, 2], 0, 0, 40);
        pkt.layer4 = None;
        tracker.handle(&pkt);

        let records = tracker.flush_all();
        match &records[0] {
            Record::Connection(c) => {
                assert_eq!(c.num_packets, 1);
                assert_eq!(c.transport_proto, "");
                assert_eq!(c.application_proto, "");
                assert_eq!(c.src_port, "");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }
}
