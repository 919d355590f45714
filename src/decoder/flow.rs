//! Directional flow tracker.
//!
//! The unidirectional counterpart of the connection tracker: one entry
//! per (link, network, transport) flow hash triple in capture direction.
//! Same table-lock/row-lock discipline, same deferred emission.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::md5_hex;
use crate::core::packet::{FlowKey, Packet};
use crate::core::records::{FlowRecord, Record, RecordType};

use super::PacketDecoder;

struct FlowState {
    first_ts: i64,
    last_ts: i64,
    src_mac: String,
    dst_mac: String,
    src_ip: String,
    dst_ip: String,
    src_port: String,
    dst_port: String,
    link_proto: String,
    network_proto: String,
    transport_proto: String,
    application_proto: String,
    num_packets: u64,
    total_size: u64,
    app_payload_size: u64,
}

impl FlowState {
    fn from_packet(pkt: &Packet) -> Self {
        let (src_port, dst_port) = match &pkt.layer4 {
            Some(l4) if l4.src_port() != 0 || l4.dst_port() != 0 => {
                (l4.src_port().to_string(), l4.dst_port().to_string())
            }
            _ => (String::new(), String::new()),
        };

        Self {
            first_ts: pkt.ts,
            last_ts: pkt.ts,
            src_mac: pkt
                .ethernet
                .as_ref()
                .map(|e| e.src_string())
                .unwrap_or_default(),
            dst_mac: pkt
                .ethernet
                .as_ref()
                .map(|e| e.dst_string())
                .unwrap_or_default(),
            src_ip: pkt
                .src_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            dst_ip: pkt
                .dst_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            src_port,
            dst_port,
            link_proto: pkt
                .ethernet
                .as_ref()
                .map(|_| "Ethernet".to_string())
                .unwrap_or_default(),
            network_proto: pkt
                .layer3
                .as_ref()
                .map(|l3| l3.proto_name().to_string())
                .unwrap_or_default(),
            transport_proto: pkt
                .layer4
                .as_ref()
                .map(|l4| l4.proto_name().to_string())
                .unwrap_or_default(),
            application_proto: pkt.app_proto_name().to_string(),
            num_packets: 1,
            total_size: pkt.wire_len as u64,
            app_payload_size: pkt.app_payload().len() as u64,
        }
    }

    fn update(&mut self, pkt: &Packet) {
        if pkt.ts < self.first_ts {
            self.first_ts = pkt.ts;
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
    }
}

struct FlowEntry {
    key: FlowKey,
    state: Mutex<FlowState>,
}

/// The shared directional flow table.
pub struct FlowTracker {
    table: Mutex<HashMap<FlowKey, Arc<FlowEntry>>>,
    timeout_ns: i64,
}

impl FlowTracker {
    pub fn new(timeout_ns: i64) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            timeout_ns,
        }
    }

    pub fn active(&self) -> usize {
        self.table.lock().len()
    }

    fn drain<F>(&self, predicate: F) -> Vec<Arc<FlowEntry>>
    where
        F: Fn(&FlowEntry) -> bool,
    {
        let mut table = self.table.lock();
        let keys: Vec<FlowKey> = table
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
        drained
    }

    fn to_record(entry: &FlowEntry) -> Record {
        let state = entry.state.lock();
        let mut key_bytes = [0u8; 24];
        key_bytes[..8].copy_from_slice(&entry.key.link.to_be_bytes());
        key_bytes[8..16].copy_from_slice(&entry.key.network.to_be_bytes());
        key_bytes[16..].copy_from_slice(&entry.key.transport.to_be_bytes());

        Record::Flow(FlowRecord {
            timestamp_first: state.first_ts,
            timestamp_last: state.last_ts,
            duration: state.last_ts - state.first_ts,
            uid: md5_hex(&key_bytes),
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
            num_packets: state.num_packets,
            total_size: state.total_size,
            app_payload_size: state.app_payload_size,
        })
    }
}

impl PacketDecoder for FlowTracker {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn record_type(&self) -> RecordType {
        RecordType::Flow
    }

    fn description(&self) -> &'static str {
        "uni-directional flow between two hosts in capture direction"
    }

    fn handle(&self, pkt: &Packet) -> Option<Record> {
        let key = pkt.flow_key();

        let entry = {
            let mut table = self.table.lock();
            if let Some(entry) = table.get(&key) {
                entry.clone()
            } else {
                let entry = Arc::new(FlowEntry {
                    key,
                    state: Mutex::new(FlowState::from_packet(pkt)),
                });
                table.insert(key, entry);
                return None;
            }
        };

        entry.state.lock().update(pkt);
        None
    }

    fn flush_idle(&self, now: i64) -> Vec<Record> {
        let timeout = self.timeout_ns;
        let drained = self.drain(|entry| {
            now.saturating_sub(entry.state.lock().last_ts) > timeout
        });
        drained.iter().map(|e| Self::to_record(e)).collect()
    }

    fn flush_all(&self) -> Vec<Record> {
        let drained = self.drain(|_| true);
        drained.iter().map(|e| Self::to_record(e)).collect()
    }
}
