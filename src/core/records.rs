//! Audit record model.
//!
//! One record type per decoder. The pipeline treats each record as an
//! opaque typed payload with a small capability set: timestamp, src/dst,
//! CSV row, JSON serialization, and a per-type metric counter. Dispatch
//! happens over the `Record` tagged enum.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type tag for every audit record shape this build produces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Connection,
    Flow,
    Pop3,
    File,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Connection => "Connection",
            RecordType::Flow => "Flow",
            RecordType::Pop3 => "POP3",
            RecordType::File => "File",
        }
    }

    /// All record types, in registry order
    pub fn all() -> &'static [RecordType] {
        &[
            RecordType::Connection,
            RecordType::Flow,
            RecordType::Pop3,
            RecordType::File,
        ]
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// File header written once per output, before any record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Record type contained in this file
    pub record_type: RecordType,
    /// Input file name or interface
    pub source: String,
    /// Producer version
    pub version: String,
    /// Capture start time
    pub created: DateTime<Utc>,
    /// Whether payload data is included in the records
    pub contains_payloads: bool,
}

impl Header {
    pub fn new(
        record_type: RecordType,
        source: &str,
        created: DateTime<Utc>,
        contains_payloads: bool,
    ) -> Self {
        Self {
            record_type,
            source: source.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created,
            contains_payloads,
        }
    }
}

/// Bidirectional connection between two endpoints, combining the link,
/// network and transport layer identifiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub timestamp_first: i64,
    pub timestamp_last: i64,
    /// Duration in nanoseconds (last - first)
    pub duration: i64,
    /// MD5 of the canonical connection key
    pub uid: String,
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
    pub link_proto: String,
    pub network_proto: String,
    pub transport_proto: String,
    pub application_proto: String,
    /// Well-known service name for the server port, if resolvable
    pub service: String,
    pub num_packets: u64,
    pub total_size: u64,
    pub app_payload_size: u64,
    /// Shannon entropy of the accumulated app payload (bits/byte),
    /// present only when entropy calculation is enabled
    pub entropy: f64,
}

/// Unidirectional flow in capture direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub timestamp_first: i64,
    pub timestamp_last: i64,
    pub duration: i64,
    pub uid: String,
    pub src_mac: String,
    pub dst_mac: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
    pub link_proto: String,
    pub network_proto: String,
    pub transport_proto: String,
    pub application_proto: String,
    pub num_packets: u64,
    pub total_size: u64,
    pub app_payload_size: u64,
}

/// A reconstructed mail message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub return_path: String,
    pub delivery_date: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    pub references: String,
    pub in_reply_to: String,
    pub content_language: String,
    pub x_originating_ip: String,
    pub content_type: String,
    pub envelope_to: String,
    pub body: String,
}

/// One POP3 session, emitted once per connection at stream close.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pop3Record {
    pub timestamp: i64,
    pub client: String,
    pub server: String,
    pub auth_token: String,
    pub user: String,
    pub pass: String,
    pub mails: Vec<MailMessage>,
}

/// Packet context attached to extracted artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketContext {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
}

/// An extracted file written below the file storage root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub timestamp: i64,
    pub name: String,
    pub length: u64,
    /// MD5 of the file contents, hex encoded
    pub hash: String,
    /// On-disk location
    pub location: String,
    /// Stream ident (src:sport-dst:dport)
    pub ident: String,
    /// Producing decoder, e.g. "POP3" or "HTTP"
    pub source: String,
    pub content_type: String,
    pub context: PacketContext,
}

/// Tagged variant over every record shape, used for writer dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Connection(ConnectionRecord),
    Flow(FlowRecord),
    Pop3(Pop3Record),
    File(FileRecord),
}

impl Record {
    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Connection(_) => RecordType::Connection,
            Record::Flow(_) => RecordType::Flow,
            Record::Pop3(_) => RecordType::Pop3,
            Record::File(_) => RecordType::File,
        }
    }

    /// Record timestamp in nanoseconds
    pub fn timestamp(&self) -> i64 {
        match self {
            Record::Connection(c) => c.timestamp_first,
            Record::Flow(f) => f.timestamp_first,
            Record::Pop3(p) => p.timestamp,
            Record::File(f) => f.timestamp,
        }
    }

    /// Source endpoint description
    pub fn src(&self) -> &str {
        match self {
            Record::Connection(c) => &c.src_ip,
            Record::Flow(f) => &f.src_ip,
            Record::Pop3(p) => &p.client,
            Record::File(f) => &f.context.src_ip,
        }
    }

    /// Destination endpoint description
    pub fn dst(&self) -> &str {
        match self {
            Record::Connection(c) => &c.dst_ip,
            Record::Flow(f) => &f.dst_ip,
            Record::Pop3(p) => &p.server,
            Record::File(f) => &f.context.dst_ip,
        }
    }

    /// CSV column names for a record type
    pub fn csv_header(record_type: RecordType) -> &'static [&'static str] {
        match record_type {
            RecordType::Connection => &[
                "timestamp_first",
                "timestamp_last",
                "duration",
                "uid",
                "src_mac",
                "dst_mac",
                "src_ip",
                "dst_ip",
                "src_port",
                "dst_port",
                "link_proto",
                "network_proto",
                "transport_proto",
                "application_proto",
                "service",
                "num_packets",
                "total_size",
                "app_payload_size",
                "entropy",
            ],
            RecordType::Flow => &[
                "timestamp_first",
                "timestamp_last",
                "duration",
                "uid",
                "src_mac",
                "dst_mac",
                "src_ip",
                "dst_ip",
                "src_port",
                "dst_port",
                "link_proto",
                "network_proto",
                "transport_proto",
                "application_proto",
                "num_packets",
                "total_size",
                "app_payload_size",
            ],
            RecordType::Pop3 => &[
                "timestamp",
                "client",
                "server",
                "auth_token",
                "user",
                "pass",
                "num_mails",
            ],
            RecordType::File => &[
                "timestamp",
                "name",
                "length",
                "hash",
                "location",
                "ident",
                "source",
                "content_type",
                "src_ip",
                "dst_ip",
                "src_port",
                "dst_port",
            ],
        }
    }

    /// CSV row for this record. Field order matches `csv_header`.
    pub fn csv_record(&self) -> Vec<String> {
        match self {
            Record::Connection(c) => vec![
                c.timestamp_first.to_string(),
                c.timestamp_last.to_string(),
                c.duration.to_string(),
                c.uid.clone(),
                c.src_mac.clone(),
                c.dst_mac.clone(),
                c.src_ip.clone(),
                c.dst_ip.clone(),
                c.src_port.clone(),
                c.dst_port.clone(),
                c.link_proto.clone(),
                c.network_proto.clone(),
                c.transport_proto.clone(),
                c.application_proto.clone(),
                c.service.clone(),
                c.num_packets.to_string(),
                c.total_size.to_string(),
                c.app_payload_size.to_string(),
                format!("{:.4}", c.entropy),
            ],
            Record::Flow(f) => vec![
                f.timestamp_first.to_string(),
                f.timestamp_last.to_string(),
                f.duration.to_string(),
                f.uid.clone(),
                f.src_mac.clone(),
                f.dst_mac.clone(),
                f.src_ip.clone(),
                f.dst_ip.clone(),
                f.src_port.clone(),
                f.dst_port.clone(),
                f.link_proto.clone(),
                f.network_proto.clone(),
                f.transport_proto.clone(),
                f.application_proto.clone(),
                f.num_packets.to_string(),
                f.total_size.to_string(),
                f.app_payload_size.to_string(),
            ],
            Record::Pop3(p) => vec![
                p.timestamp.to_string(),
                p.client.clone(),
                p.server.clone(),
                p.auth_token.clone(),
                p.user.clone(),
                p.pass.clone(),
                p.mails.len().to_string(),
            ],
            Record::File(f) => vec![
                f.timestamp.to_string(),
                f.name.clone(),
                f.length.to_string(),
                f.hash.clone(),
                f.location.clone(),
                f.ident.clone(),
                f.source.clone(),
                f.content_type.clone(),
                f.context.src_ip.clone(),
                f.context.dst_ip.clone(),
                f.context.src_port.clone(),
                f.context.dst_port.clone(),
            ],
        }
    }
}

/// Per-type atomic record counters, shared across the pipeline.
#[derive(Debug, Default)]
pub struct RecordStats {
    connection: AtomicU64,
    flow: AtomicU64,
    pop3: AtomicU64,
    file: AtomicU64,
}

impl RecordStats {
    pub fn inc(&self, record_type: RecordType) {
        self.counter(record_type).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, record_type: RecordType) -> u64 {
        self.counter(record_type).load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        RecordType::all().iter().map(|t| self.get(*t)).sum()
    }

    fn counter(&self, record_type: RecordType) -> &AtomicU64 {
        match record_type {
            RecordType::Connection => &self.connection,
            RecordType::Flow => &self.flow,
            RecordType::Pop3 => &self.pop3,
            RecordType::File => &self.file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_header_matches_row_width() {
        let conn = Record::Connection(ConnectionRecord::default());
        assert_eq!(
            conn.csv_record().len(),
            Record::csv_header(RecordType::Connection).len()
        );

        let file = Record::File(FileRecord::default());
        assert_eq!(
            file.csv_record().len(),
            Record::csv_header(RecordType::File).len()
        );
    }

    #[test]
    fn test_record_json_tag() {
        let rec = Record::Pop3(Pop3Record {
            user: "alice".into(),
            ..Default::default()
        });
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"type\":\"pop3\""));
        assert!(json.contains("\"user\":\"alice\""));
    }

    #[test]
    fn test_record_stats() {
        let stats = RecordStats::default();
        stats.inc(RecordType::Connection);
        stats.inc(RecordType::Connection);
        stats.inc(RecordType::File);
        assert_eq!(stats.get(RecordType::Connection), 2);
        assert_eq!(stats.get(RecordType::File), 1);
        assert_eq!(stats.total(), 3);
    }
}
