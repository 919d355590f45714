//! Worker loop.
//!
//! Each worker drains its own bounded packet channel, runs every packet
//! through the decoder registry and feeds TCP segments into its private
//! reassembler. Because the orchestrator shards by flow hash, a worker
//! never sees a flow another worker owns.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::core::packet::Packet;
use crate::decoder::DecoderRegistry;
use crate::stream::reassembly::ReassemblyStats;
use crate::stream::TcpReassembler;

/// Segments between reassembly timeout sweeps on a busy channel.
const SWEEP_EVERY: u64 = 10_000;

pub struct Worker {
    id: usize,
    rx: Receiver<Packet>,
    registry: Arc<DecoderRegistry>,
    reassembler: TcpReassembler,
}

impl Worker {
    pub fn new(
        id: usize,
        rx: Receiver<Packet>,
        registry: Arc<DecoderRegistry>,
        reassembler: TcpReassembler,
    ) -> Self {
        Self {
            id,
            rx,
            registry,
            reassembler,
        }
    }

    /// Drain packets until the dispatch channel closes, then tear down
    /// the reassembler (which unblocks and joins its stream readers).
    pub fn run(mut self) -> ReassemblyStats {
        let mut handled: u64 = 0;
        loop {
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(pkt) => {
                    self.registry.handle_packet(&pkt);
                    if pkt.is_tcp() {
                        self.reassembler.process(&pkt);
                    }
                    handled += 1;
                    if handled % SWEEP_EVERY == 0 {
                        self.reassembler.sweep(self.registry.latest_ts());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // idle: run the inactivity sweep on capture time
                    let now = self.registry.latest_ts();
                    if now > 0 {
                        self.reassembler.sweep(now);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!(
            "worker {} done: {} packets, {} open streams at shutdown",
            self.id,
            handled,
            self.reassembler.active()
        );
        self.reassembler.shutdown();
        self.reassembler.stats()
    }
}
