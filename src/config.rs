//! Pipeline configuration.
//!
//! Loaded from a TOML file and overridden by CLI flags. Every subsystem
//! gets its own section; defaults match the capture tool's defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::parse::DecodeMode;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub decode: DecodeConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,
}

/// Input selection and worker fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Capture file to read (classic pcap or pcapng, auto-detected)
    pub read: Option<PathBuf>,
    /// Interface for live capture
    pub iface: Option<String>,
    /// BPF filter expression (requires the libpcap-backed source)
    pub bpf: Option<String>,
    /// Worker count (0 = number of cores)
    pub workers: usize,
    /// Bounded dispatch channel depth per worker
    pub packet_buffer_size: usize,
    /// Promiscuous mode for live capture
    pub promisc: bool,
    /// Snapshot length for live capture
    pub snaplen: i32,
    /// Optional HTTP shutdown endpoint, e.g. "127.0.0.1:7171"
    pub http_shutdown: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read: None,
            iface: None,
            bpf: None,
            workers: 0,
            packet_buffer_size: 100,
            promisc: true,
            snaplen: 1514,
            http_shutdown: None,
        }
    }
}

impl CaptureConfig {
    /// Actual worker count
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }
}

/// Per-packet decoding and tracker timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeConfig {
    /// Decoders to enable (empty = all)
    pub include: Vec<String>,
    /// Decoders to disable
    pub exclude: Vec<String>,
    /// Copy payloads lazily (TCP only) or eagerly (all transports)
    pub lazy: bool,
    /// Calculate app-payload entropy for connections
    pub entropy: bool,
    /// Flow tracker idle flush interval (seconds)
    pub flow_flush_interval: u64,
    /// Flow idle timeout (seconds)
    pub flow_timeout: u64,
    /// Connection tracker idle flush interval (seconds)
    pub conn_flush_interval: u64,
    /// Connection idle timeout (seconds)
    pub conn_timeout: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            lazy: false,
            entropy: false,
            flow_flush_interval: 10,
            flow_timeout: 30,
            conn_flush_interval: 10,
            conn_timeout: 60,
        }
    }
}

impl DecodeConfig {
    pub fn mode(&self) -> DecodeMode {
        if self.lazy {
            DecodeMode::Lazy
        } else {
            DecodeMode::Eager
        }
    }

    pub fn flow_idle(&self) -> Duration {
        Duration::from_secs(self.flow_timeout)
    }

    pub fn conn_idle(&self) -> Duration {
        Duration::from_secs(self.conn_timeout)
    }
}

/// TCP reassembly and stream reader behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Treat the first segment of an unseen tuple as an established stream
    pub allow_missing_init: bool,
    /// Verify checksums: segments failing their TCP checksum are not
    /// reassembled, and IPv4 packets with a bad header checksum are
    /// dropped at decode
    pub checksum: bool,
    /// Skip TCP option sanity checks
    pub no_opt_check: bool,
    /// Ignore TCP state machine violations
    pub ignore_fsm_err: bool,
    /// Deliver buffered bytes of truncated streams
    pub write_incomplete: bool,
    /// Per-direction reassembly channel depth (chunks)
    pub stream_buffer_size: usize,
    /// Seconds a sequence gap may persist before the stream is truncated
    pub close_pending_timeout: u64,
    /// Seconds without any segment before a stream is closed
    pub close_inactive_timeout: u64,
    /// Root directory for extracted files (None disables extraction)
    pub file_storage: Option<PathBuf>,
    /// Trace reassembled chunks as hexdumps
    pub hexdump: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            allow_missing_init: true,
            checksum: false,
            no_opt_check: false,
            ignore_fsm_err: false,
            write_incomplete: false,
            stream_buffer_size: 256,
            close_pending_timeout: 5,
            close_inactive_timeout: 24,
            file_storage: None,
            hexdump: false,
        }
    }
}

impl StreamConfig {
    pub fn close_pending(&self) -> Duration {
        Duration::from_secs(self.close_pending_timeout)
    }

    pub fn close_inactive(&self) -> Duration {
        Duration::from_secs(self.close_inactive_timeout)
    }
}

/// Writer sink selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory
    pub out: PathBuf,
    /// Write CSV files
    pub csv: bool,
    /// Write newline-delimited JSON files
    pub json: bool,
    /// Drop all records (benchmark mode)
    pub null: bool,
    /// Gzip-compress the output files
    pub compress: bool,
    /// Buffer writes in memory
    pub buffer: bool,
    /// Write buffer size in bytes
    pub mem_buffer_size: usize,
    /// Include payload data in records
    pub include_payloads: bool,
    /// Attach packet context (src/dst addresses) to extracted artifacts
    pub context: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            out: PathBuf::from("."),
            csv: false,
            json: false,
            null: false,
            compress: false,
            buffer: true,
            mem_buffer_size: 1024 * 1024,
            include_payloads: false,
            context: true,
        }
    }
}

/// Best-effort enrichment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Enable reverse DNS lookups
    pub reverse_dns: bool,
    /// MAC vendor database (prefix<TAB>vendor per line)
    pub mac_db: Option<PathBuf>,
    /// GeoIP database path (unknown answers when unset)
    pub geolocation_db: Option<PathBuf>,
    /// LRU cache capacity per lookup kind
    pub cache_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            reverse_dns: false,
            mac_db: None,
            geolocation_db: None,
            cache_size: 8192,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!("failed to read config file: {}", path.as_ref().display())
        })?;

        let config: Config = toml::from_str(&content).with_context(|| {
            format!("failed to parse config file: {}", path.as_ref().display())
        })?;

        Ok(config)
    }

    /// The data source description used in writer headers
    pub fn source_name(&self) -> String {
        if let Some(read) = &self.capture.read {
            read.display().to_string()
        } else if let Some(iface) = &self.capture.iface {
            iface.clone()
        } else {
            "unknown".to_string()
        }
    }

    /// Check for configurations that cannot run
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.capture.read.is_none() && self.capture.iface.is_none() {
            return Err(
                "nothing to do: need a capture file (-r/--read) or an interface (-i/--iface)"
                    .into(),
            );
        }
        if self.capture.read.is_some() && self.capture.iface.is_some() {
            return Err("--read and --iface are mutually exclusive".into());
        }
        if self.capture.bpf.is_some() && !cfg!(feature = "live") {
            return Err(
                "BPF filters require the libpcap-backed source (build with --features live)"
                    .into(),
            );
        }
        let formats = [self.output.csv, self.output.json, self.output.null];
        if formats.iter().filter(|on| **on).count() > 1 {
            return Err("pick at most one of --csv, --json, --null".into());
        }
        if self.capture.packet_buffer_size == 0 {
            return Err("packet_buffer_size must be at least 1".into());
        }
        if self.stream.stream_buffer_size == 0 {
            return Err("stream_buffer_size must be at least 1".into());
        }
        Ok(())
    }
}
