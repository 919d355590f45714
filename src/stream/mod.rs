//! TCP stream reconstruction.
//!
//! The reassembler turns TCP segments into two ordered byte streams per
//! connection (client→server and server→client) and hands them to a
//! registered stream decoder, which runs one protocol reader per
//! direction and emits audit records when the stream terminates.

pub mod extract;
pub mod http;
pub mod mail;
pub mod pop3;
pub mod reader;
pub mod reassembly;

pub use reader::{ReadStatus, Role, StreamReader};
pub use reassembly::TcpReassembler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::config::Config;
use crate::core::records::RecordType;
use crate::decoder::ConnectionTracker;
use crate::output::WriterSet;
use crate::resolver::Resolver;

/// Shared services a stream decoder needs at emission time.
pub struct StreamRuntime {
    pub config: Arc<Config>,
    pub writers: Arc<WriterSet>,
    pub conn_tracker: Arc<ConnectionTracker>,
    pub resolver: Arc<Resolver>,
}

/// Per-direction status flags shared between the reassembler and the
/// reader, so a closed channel can be told apart from an overflowed one.
#[derive(Debug, Default)]
pub struct HalfFlags {
    truncated: AtomicBool,
    overflowed: AtomicBool,
}

impl HalfFlags {
    pub fn truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }

    pub fn set_truncated(&self) {
        self.truncated.store(true, Ordering::Relaxed);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    pub fn set_overflowed(&self) {
        self.overflowed.store(true, Ordering::Relaxed);
    }
}

/// Identity of one tracked TCP connection, handed to the decoder when
/// its readers start.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// `client:port-server:port`
    pub ident: String,
    /// Connection tracker handle for parent metadata reads
    pub handle: u64,
    /// First packet timestamp (ns)
    pub first_ts: i64,
    pub client_ip: String,
    pub client_port: String,
    pub server_ip: String,
    pub server_port: String,
}

/// The channel ends and reader threads a decoder hands back to the
/// reassembler.
pub struct StreamHandles {
    pub c2s_tx: Option<Sender<Vec<u8>>>,
    pub s2c_tx: Option<Sender<Vec<u8>>>,
    pub c2s_flags: Arc<HalfFlags>,
    pub s2c_flags: Arc<HalfFlags>,
    pub joins: Vec<JoinHandle<()>>,
}

impl StreamHandles {
    pub fn sender(&self, role: Role) -> Option<&Sender<Vec<u8>>> {
        match role {
            Role::Client => self.c2s_tx.as_ref(),
            Role::Server => self.s2c_tx.as_ref(),
        }
    }

    pub fn flags(&self, role: Role) -> &Arc<HalfFlags> {
        match role {
            Role::Client => &self.c2s_flags,
            Role::Server => &self.s2c_flags,
        }
    }

    /// Drop one direction's sender so its reader sees end of stream.
    pub fn close(&mut self, role: Role) {
        match role {
            Role::Client => self.c2s_tx = None,
            Role::Server => self.s2c_tx = None,
        }
    }

    pub fn close_both(&mut self) {
        self.c2s_tx = None;
        self.s2c_tx = None;
    }
}

/// A stream decoder: declares which connections it accepts and runs the
/// per-direction readers.
pub trait StreamDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Type tag of the records this decoder emits
    fn record_type(&self) -> RecordType;

    /// Server ports this protocol is selected for by default
    fn server_ports(&self) -> &'static [u16];

    /// Protocol auto-selection probe over the first payload bytes
    fn can_match(&self, prefix: &[u8]) -> bool;

    /// Spawn the two per-direction readers for one connection.
    fn start(
        &self,
        ctx: StreamContext,
        runtime: Arc<StreamRuntime>,
    ) -> StreamHandles;
}

/// Static catalog of stream decoders, built once at startup.
pub struct StreamDecoderRegistry {
    decoders: Vec<Arc<dyn StreamDecoder>>,
}

impl StreamDecoderRegistry {
    pub fn new(cfg: &Config) -> Self {
        let mut decoders: Vec<Arc<dyn StreamDecoder>> = vec![
            Arc::new(pop3::Pop3Decoder),
            Arc::new(http::HttpDecoder),
        ];

        decoders.retain(|d| {
            let name = d.name();
            let included = cfg.decode.include.is_empty()
                || cfg.decode.include.iter().any(|i| i == name);
            let excluded = cfg.decode.exclude.iter().any(|e| e == name);
            included && !excluded
        });

        Self { decoders }
    }

    /// Names of the stream decoders, for include/exclude validation.
    pub fn known_names() -> &'static [&'static str] {
        &["pop3", "http"]
    }

    pub fn by_port(&self, port: u16) -> Option<Arc<dyn StreamDecoder>> {
        self.decoders
            .iter()
            .find(|d| d.server_ports().contains(&port))
            .cloned()
    }

    pub fn by_prefix(&self, prefix: &[u8]) -> Option<Arc<dyn StreamDecoder>> {
        self.decoders
            .iter()
            .find(|d| d.can_match(prefix))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}
