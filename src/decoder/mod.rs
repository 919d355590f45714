//! Decoder registry.
//!
//! A process-wide catalog built once at startup: every packet decoder
//! declares a name, a record type tag, a description, a per-packet
//! handler and a final-flush handler. Registration is static; include
//! and exclude lists select by name. The registry owns the tracker
//! instances and is shared into the workers, so there is no global
//! mutable state anywhere in the pipeline.

pub mod connection;
pub mod flow;

pub use connection::{ConnMeta, ConnectionTracker};
pub use flow::FlowTracker;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::core::packet::Packet;
use crate::core::records::{Record, RecordType};
use crate::errors::NetcapError;
use crate::output::WriterSet;
use crate::resolver::Resolver;

/// Capability set every packet decoder provides.
pub trait PacketDecoder: Send + Sync {
    /// Decoder name used in include/exclude lists
    fn name(&self) -> &'static str;

    /// Type tag of the records this decoder emits
    fn record_type(&self) -> RecordType;

    fn description(&self) -> &'static str;

    /// Handle one packet. Trackers defer emission to flush and return
    /// None here.
    fn handle(&self, pkt: &Packet) -> Option<Record>;

    /// Emit and remove entries idle at `now` (nanoseconds).
    fn flush_idle(&self, now: i64) -> Vec<Record>;

    /// Emit every remaining entry. Called once at shutdown.
    fn flush_all(&self) -> Vec<Record>;
}

/// All registered packet decoders plus the counters the dispatch loop
/// maintains.
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn PacketDecoder>>,
    writers: Arc<WriterSet>,
    /// Connection tracker, always constructed: the reassembler reads
    /// parent metadata through it even when its decoder is excluded.
    conn_tracker: Arc<ConnectionTracker>,
    /// Newest packet timestamp seen, drives the idle flush tickers
    latest_ts: AtomicI64,
    packets: AtomicU64,
    decode_errors: AtomicU64,
}

impl DecoderRegistry {
    /// Build the registry, applying include/exclude filtering by name.
    pub fn build(
        cfg: &Config,
        writers: Arc<WriterSet>,
        resolver: Arc<Resolver>,
    ) -> Result<Self, NetcapError> {
        let conn_tracker = Arc::new(ConnectionTracker::new(
            cfg.decode.conn_idle().as_nanos() as i64,
            cfg.decode.entropy,
            resolver.clone(),
        ));
        let flow_tracker = Arc::new(FlowTracker::new(
            cfg.decode.flow_idle().as_nanos() as i64,
        ));

        let available: Vec<Arc<dyn PacketDecoder>> =
            vec![conn_tracker.clone(), flow_tracker];

        let mut known: Vec<&'static str> =
            available.iter().map(|d| d.name()).collect();
        known.extend(crate::stream::StreamDecoderRegistry::known_names());
        for name in cfg.decode.include.iter().chain(&cfg.decode.exclude) {
            if !known.contains(&name.as_str()) {
                return Err(NetcapError::Config(format!(
                    "unknown decoder {:?} (known: {})",
                    name,
                    known.join(", ")
                )));
            }
        }

        let decoders: Vec<Arc<dyn PacketDecoder>> = available
            .into_iter()
            .filter(|d| {
                let name = d.name();
                let included = cfg.decode.include.is_empty()
                    || cfg.decode.include.iter().any(|i| i == name);
                let excluded = cfg.decode.exclude.iter().any(|e| e == name);
                included && !excluded
            })
            .collect();

        info!(
            "registered {} packet decoders: {}",
            decoders.len(),
            decoders
                .iter()
                .map(|d| d.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            decoders,
            writers,
            conn_tracker,
            latest_ts: AtomicI64::new(0),
            packets: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        })
    }

    pub fn conn_tracker(&self) -> Arc<ConnectionTracker> {
        self.conn_tracker.clone()
    }

    pub fn writers(&self) -> Arc<WriterSet> {
        self.writers.clone()
    }

    /// Dispatch one packet to every decoder.
    pub fn handle_packet(&self, pkt: &Packet) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.latest_ts.fetch_max(pkt.ts, Ordering::Relaxed);

        for decoder in &self.decoders {
            if let Some(record) = decoder.handle(pkt) {
                self.write(record);
            }
        }
    }

    /// Record a packet that failed to decode.
    pub fn count_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Run one idle-flush pass over every decoder.
    pub fn flush_idle(&self) {
        let now = self.latest_ts.load(Ordering::Relaxed);
        if now == 0 {
            return;
        }
        for decoder in &self.decoders {
            let records = decoder.flush_idle(now);
            if !records.is_empty() {
                debug!(
                    "{}: flushed {} idle entries",
                    decoder.name(),
                    records.len()
                );
            }
            for record in records {
                self.write(record);
            }
        }
    }

    /// Final flush at shutdown. A failing decoder is logged and does not
    /// abort the others.
    pub fn flush_all(&self) {
        for decoder in &self.decoders {
            let records = decoder.flush_all();
            debug!("{}: final flush of {} entries", decoder.name(), records.len());
            for record in records {
                self.write(record);
            }
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn latest_ts(&self) -> i64 {
        self.latest_ts.load(Ordering::Relaxed)
    }

    fn write(&self, record: Record) {
        if let Err(e) = self.writers.write(&record) {
            error!(
                "failed to write {} record: {}",
                record.record_type().as_str(),
                e
            );
        }
    }
}
