//! Collector: the capture orchestrator.
//!
//! Owns the full pipeline for one run: it builds the writers, the
//! decoder registry with its trackers, the stream decoder registry and
//! the resolver, fans decoded packets out to the workers by flow hash,
//! and coordinates shutdown: close the dispatch channels, join the
//! workers, final-flush every decoder, close the writers.

mod worker;

pub use worker::Worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::bounded;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::core::packet::Packet;
use crate::core::parse::decode_packet;
use crate::core::records::RecordType;
use crate::decoder::DecoderRegistry;
use crate::errors::{NetcapError, Result, SourceError};
use crate::output::WriterSet;
use crate::resolver::Resolver;
use crate::source::PacketSource;
use crate::stream::reassembly::ReassemblyStats;
use crate::stream::{StreamDecoderRegistry, StreamRuntime, TcpReassembler};

/// Counters reported after a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub packets: u64,
    pub decode_errors: u64,
    pub records: Vec<(RecordType, u64)>,
    pub elapsed: Duration,
    pub reassembly: ReassemblyStats,
}

pub struct Collector {
    cfg: Arc<Config>,
    writers: Arc<WriterSet>,
    registry: Arc<DecoderRegistry>,
    stream_registry: Arc<StreamDecoderRegistry>,
    runtime: Arc<StreamRuntime>,
    shutdown: Arc<AtomicBool>,
}

impl Collector {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().map_err(NetcapError::Config)?;
        let cfg = Arc::new(cfg);

        let writers = Arc::new(
            WriterSet::build(&cfg.output, &cfg.source_name(), Utc::now())
                .map_err(NetcapError::Write)?,
        );
        let resolver = Arc::new(Resolver::new(cfg.resolver.clone()));
        let registry = Arc::new(DecoderRegistry::build(
            &cfg,
            writers.clone(),
            resolver.clone(),
        )?);
        let stream_registry = Arc::new(StreamDecoderRegistry::new(&cfg));
        let runtime = Arc::new(StreamRuntime {
            config: cfg.clone(),
            writers: writers.clone(),
            conn_tracker: registry.conn_tracker(),
            resolver,
        });

        Ok(Self {
            cfg,
            writers,
            registry,
            stream_registry,
            runtime,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// External termination hook: signal handlers and the HTTP endpoint
    /// flip this flag, the ingest loop honors it between packets.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn print_configuration(&self) {
        info!(
            "collector: {} workers, channel depth {}, source {}",
            self.cfg.capture.actual_workers(),
            self.cfg.capture.packet_buffer_size,
            self.cfg.source_name(),
        );
        info!(
            "timeouts: flow {}s, conn {}s, close-pending {}s, close-inactive {}s",
            self.cfg.decode.flow_timeout,
            self.cfg.decode.conn_timeout,
            self.cfg.stream.close_pending_timeout,
            self.cfg.stream.close_inactive_timeout,
        );
    }

    /// Run the pipeline to completion over one packet source.
    pub fn run(
        &self,
        mut source: Box<dyn PacketSource>,
    ) -> Result<RunSummary> {
        let start = Instant::now();
        let worker_count = self.cfg.capture.actual_workers();

        // one bounded channel per worker: per-flow ordering comes from
        // sharding, depth bounds memory
        let mut senders = Vec::with_capacity(worker_count);
        let mut joins = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, rx) =
                bounded::<Packet>(self.cfg.capture.packet_buffer_size);
            let worker = Worker::new(
                id,
                rx,
                self.registry.clone(),
                TcpReassembler::new(
                    self.runtime.clone(),
                    self.stream_registry.clone(),
                ),
            );
            let handle = std::thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || worker.run())
                .expect("spawn worker thread");
            senders.push(tx);
            joins.push(handle);
        }

        // tracker idle flush ticker
        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let stop = ticker_stop.clone();
            let registry = self.registry.clone();
            let interval = Duration::from_secs(
                self.cfg
                    .decode
                    .flow_flush_interval
                    .min(self.cfg.decode.conn_flush_interval)
                    .max(1),
            );
            std::thread::Builder::new()
                .name("flush-ticker".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::park_timeout(interval);
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        registry.flush_idle();
                    }
                })
                .expect("spawn flush ticker")
        };

        if let Some(addr) = &self.cfg.capture.http_shutdown {
            spawn_shutdown_endpoint(addr.clone(), self.shutdown.clone());
        }

        // ingest loop
        let mode = self.cfg.decode.mode();
        let verify_checksums = self.cfg.stream.checksum;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping ingest");
                break;
            }

            let frame = match source.next() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(SourceError::Transient(e)) => {
                    warn!("transient source error: {}", e);
                    continue;
                }
                Err(e) => {
                    // a dead source stops ingest and triggers the final
                    // flush; records seen so far are still emitted
                    error!("source failed: {}", e);
                    break;
                }
            };

            match decode_packet(
                &frame.data,
                frame.link,
                frame.ts,
                frame.cap_len,
                frame.wire_len,
                mode,
                verify_checksums,
            ) {
                Ok(pkt) => {
                    let shard =
                        (pkt.shard_hash() % worker_count as u64) as usize;
                    if senders[shard].send(pkt).is_err() {
                        error!("worker {} gone, stopping ingest", shard);
                        break;
                    }
                }
                Err(e) => {
                    self.registry.count_decode_error();
                    trace!("skipping packet: {}", e);
                }
            }
        }

        // close dispatch, wait for workers to drain
        drop(senders);
        let mut reassembly = ReassemblyStats::default();
        for handle in joins {
            match handle.join() {
                Ok(stats) => {
                    reassembly.streams_created += stats.streams_created;
                    reassembly.segments += stats.segments;
                    reassembly.bytes_delivered += stats.bytes_delivered;
                    reassembly.overflows += stats.overflows;
                    reassembly.truncations += stats.truncations;
                    reassembly.fsm_errors += stats.fsm_errors;
                    reassembly.checksum_errors += stats.checksum_errors;
                }
                Err(_) => error!("worker thread panicked"),
            }
        }

        ticker_stop.store(true, Ordering::Relaxed);
        ticker.thread().unpark();
        let _ = ticker.join();

        // final flush: every decoder, then the writers
        self.registry.flush_all();
        self.writers.close_all();

        let summary = RunSummary {
            packets: self.registry.packets(),
            decode_errors: self.registry.decode_errors(),
            records: RecordType::all()
                .iter()
                .map(|&t| (t, self.writers.stats.get(t)))
                .collect(),
            elapsed: start.elapsed(),
            reassembly,
        };

        info!(
            "done in {:.2?}: {} packets, {} decode errors, {} records",
            summary.elapsed,
            summary.packets,
            summary.decode_errors,
            summary.records.iter().map(|(_, n)| n).sum::<u64>(),
        );
        for (record_type, count) in &summary.records {
            if *count > 0 {
                debug!("  {}: {} records", record_type.as_str(), count);
            }
        }

        Ok(summary)
    }
}

/// Graceful termination over HTTP: POST /shutdown flips the flag the
/// ingest loop polls.
fn spawn_shutdown_endpoint(addr: String, flag: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("http-shutdown".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("shutdown endpoint runtime failed: {}", e);
                    return;
                }
            };

            runtime.block_on(async move {
                let app = axum::Router::new().route(
                    "/shutdown",
                    axum::routing::post({
                        let flag = flag.clone();
                        move || {
                            let flag = flag.clone();
                            async move {
                                flag.store(true, Ordering::Relaxed);
                                "shutting down\n"
                            }
                        }
                    }),
                );

                match tokio::net::TcpListener::bind(&addr).await {
                    Ok(listener) => {
                        info!("shutdown endpoint on http://{}/shutdown", addr);
                        if let Err(e) = axum::serve(listener, app).await {
                            error!("shutdown endpoint failed: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("failed to bind shutdown endpoint: {}", e)
                    }
                }
            });
        });

    if let Err(e) = spawned {
        error!("failed to spawn shutdown endpoint thread: {}", e);
    }
}
