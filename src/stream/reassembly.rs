//! TCP reassembly.
//!
//! Presents each TCP connection as two ordered byte streams, one per
//! direction. Out-of-order segments are buffered by sequence number,
//! overlaps are trimmed, retransmits dropped. Reassembled bytes are
//! posted to a bounded channel per direction; a reader that cannot keep
//! up first exerts backpressure and is closed as overflowed if the
//! buffer stays exhausted.
//!
//! Each worker owns one reassembler, and all packets of a flow hash to
//! the same worker, so connection state is never shared across threads.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::SendTimeoutError;
use tracing::{debug, trace, warn};

use crate::core::packet::Packet;

use super::reader::Role;
use super::{
    StreamContext, StreamDecoderRegistry, StreamHandles, StreamRuntime,
};

/// Bytes of leading payload inspected for protocol auto-selection when
/// no decoder claims the server port.
const PROBE_LIMIT: usize = 4096;

/// How long a delivery may block on a full stream channel before the
/// stream is declared overflowed.
const OVERFLOW_WAIT: Duration = Duration::from_secs(5);

type Endpoint = (IpAddr, u16);

/// Half-connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Closed,
    SynSent,
    Established,
    HalfClosed,
    Reset,
}

/// Reassembly counters, aggregated per worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReassemblyStats {
    pub streams_created: u64,
    pub segments: u64,
    pub bytes_delivered: u64,
    pub overflows: u64,
    pub truncations: u64,
    pub fsm_errors: u64,
    pub checksum_errors: u64,
}

struct Half {
    state: TcpState,
    next_seq: Option<u32>,
    /// Out-of-order segments keyed by sequence number
    ooo: BTreeMap<u32, Vec<u8>>,
    delivered: u64,
    fin_seen: bool,
    closed: bool,
    /// Capture time when the current sequence gap opened
    gap_since: Option<i64>,
}

impl Half {
    fn new(state: TcpState) -> Self {
        Self {
            state,
            next_seq: None,
            ooo: BTreeMap::new(),
            delivered: 0,
            fin_seen: false,
            closed: false,
            gap_since: None,
        }
    }
}

struct TcpConn {
    client: Endpoint,
    server: Endpoint,
    ident: String,
    handle: u64,
    first_ts: i64,
    last_seen: i64,
    /// [0] = client→server, [1] = server→client
    halves: [Half; 2],
    handles: Option<StreamHandles>,
    /// Contiguous bytes accumulated before a decoder is selected
    pending: [Vec<u8>; 2],
    /// No decoder matched within the probe limit; bytes are discarded
    no_decoder: bool,
    syn_ack_seen: bool,
}

impl TcpConn {
    fn both_closed(&self) -> bool {
        self.halves.iter().all(|h| h.closed)
    }
}

/// Per-worker TCP reassembler.
pub struct TcpReassembler {
    conns: HashMap<(Endpoint, Endpoint), TcpConn>,
    runtime: Arc<StreamRuntime>,
    registry: Arc<StreamDecoderRegistry>,
    stats: ReassemblyStats,
    /// Reader threads of finished connections, joined at shutdown
    joins: Vec<JoinHandle<()>>,
}

impl TcpReassembler {
    pub fn new(
        runtime: Arc<StreamRuntime>,
        registry: Arc<StreamDecoderRegistry>,
    ) -> Self {
        Self {
            conns: HashMap::new(),
            runtime,
            registry,
            stats: ReassemblyStats::default(),
            joins: Vec::new(),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    pub fn active(&self) -> usize {
        self.conns.len()
    }

    /// Feed one TCP segment.
    pub fn process(&mut self, pkt: &Packet) {
        let Some(tcp) = pkt.tcp() else {
            return;
        };
        let (Some(src_ip), Some(dst_ip)) = (pkt.src_ip(), pkt.dst_ip())
        else {
            return;
        };
        let src = (src_ip, tcp.src_port);
        let dst = (dst_ip, tcp.dst_port);
        let key = canonical(src, dst);
        let cfg = self.runtime.config.clone();

        self.stats.segments += 1;

        // checksum verification happens before a segment is admitted:
        // a corrupted segment must not reach the byte streams
        if cfg.stream.checksum && !tcp.checksum_valid {
            self.stats.checksum_errors += 1;
            trace!("dropping segment with bad TCP checksum from {}", src.0);
            return;
        }

        // segment sanity: SYN+FIN never occurs in a legitimate stream
        if !cfg.stream.no_opt_check && tcp.flags.syn && tcp.flags.fin {
            self.stats.fsm_errors += 1;
            if !cfg.stream.ignore_fsm_err {
                trace!("dropping SYN+FIN segment from {}", src.0);
                return;
            }
        }

        if !self.conns.contains_key(&key) {
            let is_syn = tcp.flags.is_syn();
            if !is_syn && !cfg.stream.allow_missing_init {
                self.stats.fsm_errors += 1;
                if !cfg.stream.ignore_fsm_err {
                    trace!(
                        "dropping mid-stream segment for untracked {} -> {}",
                        src.0,
                        dst.0
                    );
                    return;
                }
            }

            let initial = if is_syn {
                TcpState::SynSent
            } else {
                // missing init: treat the first segment as established
                TcpState::Established
            };

            let handle = self
                .runtime
                .conn_tracker
                .handle_for(pkt)
                .unwrap_or_default();
            let ident = format!(
                "{}:{}-{}:{}",
                src.0, src.1, dst.0, dst.1
            );
            debug!("new tcp stream {}", ident);
            self.stats.streams_created += 1;

            let mut conn = TcpConn {
                client: src,
                server: dst,
                ident,
                handle,
                first_ts: pkt.ts,
                last_seen: pkt.ts,
                halves: [Half::new(initial), Half::new(TcpState::Closed)],
                handles: None,
                pending: [Vec::new(), Vec::new()],
                no_decoder: false,
                syn_ack_seen: false,
            };

            // port-based decoder selection happens up front
            if let Some(decoder) = self.registry.by_port(dst.1) {
                conn.handles = Some(decoder.start(
                    self.context_for(&conn),
                    self.runtime.clone(),
                ));
            } else if self.registry.is_empty() {
                conn.no_decoder = true;
            }

            self.conns.insert(key, conn);
        }

        let conn = self.conns.get_mut(&key).expect("conn just ensured");
        conn.last_seen = pkt.ts;
        let dir = if src == conn.client { 0 } else { 1 };
        let role = role_of(dir);

        // state transitions
        if tcp.flags.rst {
            conn.halves[0].state = TcpState::Reset;
            conn.halves[1].state = TcpState::Reset;
            close_half(conn, Role::Client, &mut self.stats, &cfg.stream);
            close_half(conn, Role::Server, &mut self.stats, &cfg.stream);
            self.finish(key);
            return;
        }
        if tcp.flags.is_syn() && dir == 0 {
            if conn.halves[0].state == TcpState::Closed {
                conn.halves[0].state = TcpState::SynSent;
            }
        } else if tcp.flags.is_syn_ack() && dir == 1 {
            conn.syn_ack_seen = true;
            conn.halves[1].state = TcpState::SynSent;
        } else if tcp.flags.ack && conn.syn_ack_seen {
            for half in &mut conn.halves {
                if half.state == TcpState::SynSent {
                    half.state = TcpState::Established;
                }
            }
        }

        // sequence bookkeeping: SYN consumes one sequence number
        let data_seq = if tcp.flags.syn {
            tcp.seq.wrapping_add(1)
        } else {
            tcp.seq
        };
        if conn.halves[dir].next_seq.is_none() {
            conn.halves[dir].next_seq = Some(data_seq);
        }

        if !tcp.payload.is_empty() && !conn.halves[dir].closed {
            let ready =
                insert_segment(&mut conn.halves[dir], data_seq, &tcp.payload, pkt.ts);
            self.stats.bytes_delivered +=
                ready.iter().map(|c| c.len() as u64).sum::<u64>();
            deliver(
                conn,
                dir,
                ready,
                &self.registry,
                &self.runtime,
                &mut self.stats,
                cfg.stream.hexdump,
            );
        }

        if tcp.flags.fin {
            conn.halves[dir].fin_seen = true;
        }
        // a FIN closes its direction once the stream has no holes left
        if conn.halves[dir].fin_seen
            && conn.halves[dir].ooo.is_empty()
            && !conn.halves[dir].closed
        {
            conn.halves[dir].state = TcpState::HalfClosed;
            close_half(conn, role, &mut self.stats, &cfg.stream);
        }

        if conn.both_closed() {
            self.finish(key);
        }
    }

    /// Timeout sweep, driven by capture time: half-streams whose gap has
    /// outlived the close-pending timeout are truncated, connections
    /// idle past the inactivity timeout are closed.
    pub fn sweep(&mut self, now: i64) {
        let cfg = self.runtime.config.clone();
        let close_pending = cfg.stream.close_pending().as_nanos() as i64;
        let close_inactive = cfg.stream.close_inactive().as_nanos() as i64;

        let mut finished = Vec::new();
        for (key, conn) in self.conns.iter_mut() {
            if now.saturating_sub(conn.last_seen) > close_inactive {
                debug!("closing inactive stream {}", conn.ident);
                close_half(conn, Role::Client, &mut self.stats, &cfg.stream);
                close_half(conn, Role::Server, &mut self.stats, &cfg.stream);
                finished.push(*key);
                continue;
            }

            for dir in 0..2 {
                let timed_out = conn.halves[dir]
                    .gap_since
                    .map(|since| now.saturating_sub(since) > close_pending)
                    .unwrap_or(false);
                if timed_out && !conn.halves[dir].closed {
                    warn!(
                        "{}: sequence gap persisted, truncating {:?} stream",
                        conn.ident,
                        role_of(dir)
                    );
                    truncate_half(
                        conn,
                        role_of(dir),
                        &mut self.stats,
                        &cfg.stream,
                    );
                }
            }

            if conn.both_closed() {
                finished.push(*key);
            }
        }

        for key in finished {
            self.finish(key);
        }
    }

    /// Close every stream and join every reader thread. Called once at
    /// worker shutdown; record emission happens inside the reader
    /// cleanups this unblocks.
    pub fn shutdown(&mut self) {
        let cfg = self.runtime.config.clone();
        let keys: Vec<_> = self.conns.keys().copied().collect();
        for key in keys {
            if let Some(conn) = self.conns.get_mut(&key) {
                close_half(conn, Role::Client, &mut self.stats, &cfg.stream);
                close_half(conn, Role::Server, &mut self.stats, &cfg.stream);
            }
            self.finish(key);
        }

        for handle in self.joins.drain(..) {
            let _ = handle.join();
        }
    }

    fn context_for(&self, conn: &TcpConn) -> StreamContext {
        StreamContext {
            ident: conn.ident.clone(),
            handle: conn.handle,
            first_ts: conn.first_ts,
            client_ip: conn.client.0.to_string(),
            client_port: conn.client.1.to_string(),
            server_ip: conn.server.0.to_string(),
            server_port: conn.server.1.to_string(),
        }
    }

    fn finish(&mut self, key: (Endpoint, Endpoint)) {
        let Some(mut conn) = self.conns.remove(&key) else {
            return;
        };
        debug!(
            "closed stream {} (c2s {} bytes, s2c {} bytes)",
            conn.ident, conn.halves[0].delivered, conn.halves[1].delivered
        );
        if let Some(mut handles) = conn.handles.take() {
            handles.close_both();
            self.joins.append(&mut handles.joins);
        }
    }
}

fn role_of(dir: usize) -> Role {
    if dir == 0 {
        Role::Client
    } else {
        Role::Server
    }
}

fn canonical(a: Endpoint, b: Endpoint) -> (Endpoint, Endpoint) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// `a` strictly before `b` in sequence space, wraparound-aware.
fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_after(a: u32, b: u32) -> bool {
    seq_before(b, a)
}

/// Apply one segment to a half-stream. Returns the chunks that became
/// contiguous and are ready for delivery, in order.
fn insert_segment(
    half: &mut Half,
    seq: u32,
    payload: &[u8],
    ts: i64,
) -> Vec<Vec<u8>> {
    let mut expected = half.next_seq.expect("next_seq set before insert");
    let end = seq.wrapping_add(payload.len() as u32);
    let mut ready = Vec::new();

    // entirely old data: retransmit, drop
    if !seq_after(end, expected) {
        return ready;
    }

    if seq_after(seq, expected) {
        // ahead of the contiguous edge: buffer and wait
        half.ooo.entry(seq).or_insert_with(|| payload.to_vec());
        if half.gap_since.is_none() {
            half.gap_since = Some(ts);
        }
        return ready;
    }

    // contiguous, possibly overlapping already-delivered bytes
    let skip = expected.wrapping_sub(seq) as usize;
    ready.push(payload[skip..].to_vec());
    expected = end;

    // drain buffered segments that are now contiguous
    loop {
        let Some((&bseq, _)) = half.ooo.iter().next() else {
            half.gap_since = None;
            break;
        };
        if seq_after(bseq, expected) {
            // still a gap to the first buffered segment; the timer keeps
            // running from when the gap opened
            if half.gap_since.is_none() {
                half.gap_since = Some(ts);
            }
            break;
        }
        let data = half.ooo.remove(&bseq).expect("first key present");
        let bend = bseq.wrapping_add(data.len() as u32);
        if !seq_after(bend, expected) {
            continue;
        }
        let skip = expected.wrapping_sub(bseq) as usize;
        ready.push(data[skip..].to_vec());
        expected = bend;
    }

    half.next_seq = Some(expected);
    ready
}

/// Hand ready chunks to the stream decoder, selecting one by payload
/// prefix if the server port did not identify the protocol.
fn deliver(
    conn: &mut TcpConn,
    dir: usize,
    chunks: Vec<Vec<u8>>,
    registry: &Arc<StreamDecoderRegistry>,
    runtime: &Arc<StreamRuntime>,
    stats: &mut ReassemblyStats,
    hexdump_enabled: bool,
) {
    if chunks.is_empty() || conn.no_decoder {
        for chunk in &chunks {
            conn.halves[dir].delivered += chunk.len() as u64;
        }
        return;
    }

    if conn.handles.is_none() {
        for chunk in chunks {
            conn.pending[dir].extend_from_slice(&chunk);
        }

        let matched = registry
            .by_prefix(&conn.pending[0])
            .or_else(|| registry.by_prefix(&conn.pending[1]));

        if let Some(decoder) = matched {
            debug!(
                "{}: selected {} decoder by payload probe",
                conn.ident,
                decoder.name()
            );
            let ctx = StreamContext {
                ident: conn.ident.clone(),
                handle: conn.handle,
                first_ts: conn.first_ts,
                client_ip: conn.client.0.to_string(),
                client_port: conn.client.1.to_string(),
                server_ip: conn.server.0.to_string(),
                server_port: conn.server.1.to_string(),
            };
            conn.handles = Some(decoder.start(ctx, runtime.clone()));
            let buffered = std::mem::take(&mut conn.pending);
            for (pending_dir, bytes) in buffered.into_iter().enumerate() {
                if !bytes.is_empty() {
                    send_chunk(conn, pending_dir, bytes, stats, hexdump_enabled);
                }
            }
        } else if conn.pending.iter().map(|p| p.len()).sum::<usize>()
            > PROBE_LIMIT
        {
            trace!("{}: no stream decoder matched", conn.ident);
            conn.no_decoder = true;
            conn.pending = [Vec::new(), Vec::new()];
        }
        return;
    }

    for chunk in chunks {
        send_chunk(conn, dir, chunk, stats, hexdump_enabled);
    }
}

/// Post one chunk to the direction's bounded channel, blocking for
/// backpressure and declaring overflow if the buffer stays full.
fn send_chunk(
    conn: &mut TcpConn,
    dir: usize,
    chunk: Vec<u8>,
    stats: &mut ReassemblyStats,
    hexdump_enabled: bool,
) {
    let len = chunk.len() as u64;
    let role = role_of(dir);
    let Some(handles) = conn.handles.as_mut() else {
        return;
    };
    let Some(tx) = handles.sender(role) else {
        return;
    };

    if hexdump_enabled {
        trace!("{} {:?}:\n{}", conn.ident, role, hexdump(&chunk));
    }

    match tx.send_timeout(chunk, OVERFLOW_WAIT) {
        Ok(()) => {
            conn.halves[dir].delivered += len;
        }
        Err(SendTimeoutError::Timeout(_)) => {
            warn!(
                "{}: reader not draining, closing {:?} stream as overflowed",
                conn.ident, role
            );
            stats.overflows += 1;
            handles.flags(role).set_overflowed();
            handles.close(role);
            conn.halves[dir].closed = true;
        }
        Err(SendTimeoutError::Disconnected(_)) => {
            handles.close(role);
            conn.halves[dir].closed = true;
        }
    }
}

/// Close one direction, optionally delivering what the out-of-order
/// buffer still holds.
fn close_half(
    conn: &mut TcpConn,
    role: Role,
    stats: &mut ReassemblyStats,
    cfg: &crate::config::StreamConfig,
) {
    let dir = match role {
        Role::Client => 0,
        Role::Server => 1,
    };
    if conn.halves[dir].closed {
        return;
    }

    if cfg.write_incomplete && !conn.halves[dir].ooo.is_empty() {
        flush_buffered(conn, dir, stats, cfg.hexdump);
    }

    conn.halves[dir].closed = true;
    conn.halves[dir].ooo.clear();
    if let Some(handles) = conn.handles.as_mut() {
        handles.close(role);
    }
}

/// Truncate one direction after a gap timeout.
fn truncate_half(
    conn: &mut TcpConn,
    role: Role,
    stats: &mut ReassemblyStats,
    cfg: &crate::config::StreamConfig,
) {
    let dir = match role {
        Role::Client => 0,
        Role::Server => 1,
    };
    stats.truncations += 1;
    if let Some(handles) = conn.handles.as_ref() {
        handles.flags(role).set_truncated();
    }
    conn.halves[dir].state = TcpState::HalfClosed;
    close_half(conn, role, stats, cfg);
}

/// Deliver buffered out-of-order segments in sequence order, skipping
/// over the gaps. Only used when `write_incomplete` is set.
fn flush_buffered(
    conn: &mut TcpConn,
    dir: usize,
    stats: &mut ReassemblyStats,
    hexdump_enabled: bool,
) {
    let buffered: Vec<Vec<u8>> =
        conn.halves[dir].ooo.values().cloned().collect();
    conn.halves[dir].ooo.clear();
    for chunk in buffered {
        stats.bytes_delivered += chunk.len() as u64;
        send_chunk(conn, dir, chunk, stats, hexdump_enabled);
    }
}

/// Classic offset/hex/ascii dump for trace logging.
fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, row) in data.chunks(16).enumerate() {
        let hex: Vec<String> =
            row.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = row
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!(
            "{:08x}  {:<47}  {}\n",
            i * 16,
            hex.join(" "),
            ascii
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half() -> Half {
        let mut h = Half::new(TcpState::Established);
        h.next_seq = Some(1000);
        h
    }

    fn concat(chunks: Vec<Vec<u8>>) -> Vec<u8> {
        chunks.into_iter().flatten().collect()
    }

    #[test]
    fn test_in_order_delivery() {
        let mut h = half();
        let a = insert_segment(&mut h, 1000, b"abc", 1);
        let b = insert_segment(&mut h, 1003, b"def", 2);
        assert_eq!(concat(a), b"abc");
        assert_eq!(concat(b), b"def");
        assert_eq!(h.next_seq, Some(1006));
    }

    #[test]
    fn test_out_of_order_buffered_then_drained() {
        let mut h = half();
        let ahead = insert_segment(&mut h, 1003, b"def", 1);
        assert!(ahead.is_empty());
        assert!(h.gap_since.is_some());

        let both = insert_segment(&mut h, 1000, b"abc", 2);
        assert_eq!(concat(both), b"abcdef");
        assert_eq!(h.next_seq, Some(1006));
        assert!(h.gap_since.is_none());
    }

    #[test]
    fn test_retransmit_dropped() {
        let mut h = half();
        insert_segment(&mut h, 1000, b"abc", 1);
        let dup = insert_segment(&mut h, 1000, b"abc", 2);
        assert!(dup.is_empty());
        assert_eq!(h.next_seq, Some(1003));
    }

    #[test]
    fn test_overlap_trimmed() {
        let mut h = half();
        insert_segment(&mut h, 1000, b"abcd", 1);
        // resend of the last two bytes plus two new ones
        let out = insert_segment(&mut h, 1002, b"cdEF", 2);
        assert_eq!(concat(out), b"EF");
        assert_eq!(h.next_seq, Some(1006));
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut h = Half::new(TcpState::Established);
        h.next_seq = Some(u32::MAX - 1);
        let first = insert_segment(&mut h, u32::MAX - 1, b"ab", 1);
        assert_eq!(concat(first), b"ab");
        assert_eq!(h.next_seq, Some(1));
        let second = insert_segment(&mut h, 1, b"cd", 2);
        assert_eq!(concat(second), b"cd");
    }

    #[test]
    fn test_heavy_reorder_and_duplicates_reconstruct_exactly() {
        // 20% reordered, 10% duplicated, byte stream must come out exact
        let payload: Vec<u8> = (0..200u8).collect();
        let mut segments: Vec<(u32, Vec<u8>)> = payload
            .chunks(10)
            .enumerate()
            .map(|(i, chunk)| (1000 + (i as u32) * 10, chunk.to_vec()))
            .collect();

        // reorder: swap segments 4/5, 10/11, 14/15, 18/19
        for pair in [(4, 5), (10, 11), (14, 15), (18, 19)] {
            segments.swap(pair.0, pair.1);
        }
        // duplicate two segments
        let dup_a = segments[3].clone();
        let dup_b = segments[12].clone();
        segments.insert(7, dup_a);
        segments.push(dup_b);

        let mut h = half();
        let mut out = Vec::new();
        for (seq, data) in segments {
            out.extend(concat(insert_segment(&mut h, seq, &data, 1)));
        }
        assert_eq!(out, payload);
        assert!(h.ooo.is_empty());
    }

    #[test]
    fn test_seq_compare() {
        assert!(seq_before(1, 2));
        assert!(seq_before(u32::MAX, 0));
        assert!(!seq_before(2, 1));
        assert!(seq_after(0, u32::MAX));
    }

    #[test]
    fn test_hexdump_format() {
        let dump = hexdump(b"ABC");
        assert!(dump.starts_with("00000000"));
        assert!(dump.contains("41 42 43"));
        assert!(dump.trim_end().ends_with("ABC"));
    }
}
