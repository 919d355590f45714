use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use netcap::config::Config;
use netcap::source::PacketSource;
use netcap::Collector;

#[derive(Parser)]
#[command(name = "net")]
#[command(author, version, about = "traffic analysis framework: capture audit records from network traffic")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture audit records from a capture file or live interface
    Capture(CaptureArgs),
}

#[derive(Args)]
pub struct CaptureArgs {
    /// Capture file to read (pcap or pcapng, auto-detected)
    #[arg(short, long, value_name = "FILE")]
    pub read: Option<PathBuf>,

    /// Interface for live capture
    #[arg(short, long, value_name = "NAME")]
    pub iface: Option<String>,

    /// BPF filter expression (needs the libpcap-backed source)
    #[arg(long, value_name = "EXPR")]
    pub bpf: Option<String>,

    /// Output directory for audit record files
    #[arg(short, long, default_value = ".", value_name = "DIR")]
    pub out: PathBuf,

    /// Configuration file (flags override it)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only run these decoders (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<String>,

    /// Skip these decoders (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Worker count (0 = number of cores)
    #[arg(short, long, default_value_t = 0)]
    pub workers: usize,

    /// Packet dispatch channel depth per worker
    #[arg(long, default_value_t = 100)]
    pub packet_buffer: usize,

    /// Reassembly channel depth per stream direction
    #[arg(long, default_value_t = 256)]
    pub stream_buffer: usize,

    /// Flow idle timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub flow_timeout: u64,

    /// Connection idle timeout in seconds
    #[arg(long, default_value_t = 60)]
    pub conn_timeout: u64,

    /// Seconds a TCP sequence gap may persist before truncation
    #[arg(long, default_value_t = 5)]
    pub close_pending_timeout: u64,

    /// Seconds without segments before a TCP stream is closed
    #[arg(long, default_value_t = 24)]
    pub close_inactive_timeout: u64,

    /// Write CSV instead of the binary format
    #[arg(long)]
    pub csv: bool,

    /// Write newline-delimited JSON instead of the binary format
    #[arg(long)]
    pub json: bool,

    /// Drop all records (throughput testing)
    #[arg(long)]
    pub null: bool,

    /// Gzip-compress the output files
    #[arg(long)]
    pub compress: bool,

    /// Include payload data in records
    #[arg(long)]
    pub payload: bool,

    /// Omit packet context from extracted artifacts
    #[arg(long)]
    pub no_context: bool,

    /// Calculate app-payload entropy for connections
    #[arg(long)]
    pub entropy: bool,

    /// Trace reassembled chunks as hexdumps
    #[arg(long)]
    pub hexdump: bool,

    /// Verify checksums; segments with a bad TCP checksum are not
    /// reassembled
    #[arg(long)]
    pub checksum: bool,

    /// Deliver buffered bytes of truncated streams
    #[arg(long)]
    pub write_incomplete: bool,

    /// Require a SYN before tracking a TCP stream
    #[arg(long)]
    pub strict_init: bool,

    /// Root directory for extracted files (disabled when unset)
    #[arg(long, value_name = "DIR")]
    pub file_storage: Option<PathBuf>,

    /// Serve a graceful-shutdown endpoint, e.g. 127.0.0.1:7171
    #[arg(long, value_name = "ADDR")]
    pub http_shutdown: Option<String>,

    /// Disable promiscuous mode for live capture
    #[arg(long)]
    pub no_promisc: bool,

    /// Snapshot length for live capture
    #[arg(long, default_value_t = 1514)]
    pub snaplen: i32,

    /// Enable reverse DNS enrichment
    #[arg(long)]
    pub reverse_dns: bool,
}

impl CaptureArgs {
    /// Merge the config file (if any) with the command line flags.
    fn into_config(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        cfg.capture.read = self.read.or(cfg.capture.read);
        cfg.capture.iface = self.iface.or(cfg.capture.iface);
        cfg.capture.bpf = self.bpf.or(cfg.capture.bpf);
        cfg.capture.workers = self.workers;
        cfg.capture.packet_buffer_size = self.packet_buffer;
        cfg.capture.promisc = !self.no_promisc;
        cfg.capture.snaplen = self.snaplen;
        cfg.capture.http_shutdown =
            self.http_shutdown.or(cfg.capture.http_shutdown);

        cfg.decode.include = self.include;
        cfg.decode.exclude = self.exclude;
        cfg.decode.entropy = self.entropy;
        cfg.decode.flow_timeout = self.flow_timeout;
        cfg.decode.conn_timeout = self.conn_timeout;

        cfg.stream.allow_missing_init = !self.strict_init;
        cfg.stream.checksum = self.checksum;
        cfg.stream.write_incomplete = self.write_incomplete;
        cfg.stream.stream_buffer_size = self.stream_buffer;
        cfg.stream.close_pending_timeout = self.close_pending_timeout;
        cfg.stream.close_inactive_timeout = self.close_inactive_timeout;
        cfg.stream.file_storage = self.file_storage.or(cfg.stream.file_storage);
        cfg.stream.hexdump = self.hexdump;

        cfg.output.out = self.out;
        cfg.output.csv = self.csv;
        cfg.output.json = self.json;
        cfg.output.null = self.null;
        cfg.output.compress = self.compress;
        cfg.output.include_payloads = self.payload;
        cfg.output.context = !self.no_context;

        cfg.resolver.reverse_dns = self.reverse_dns;

        Ok(cfg)
    }
}

pub fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Capture(args) => run_capture(args),
    }
}

fn run_capture(args: CaptureArgs) -> Result<()> {
    let cfg = args.into_config()?;

    let source = open_source(&cfg)?;
    let collector = Collector::new(cfg)?;
    collector.print_configuration();

    // first ctrl-c drains gracefully, a second one kills the process
    let flag = collector.shutdown_flag();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::Relaxed) {
            std::process::exit(1);
        }
        eprintln!("\nshutting down, flushing decoders (ctrl-c again to force)");
    })
    .context("failed to install signal handler")?;

    collector.run(source)?;
    Ok(())
}

fn open_source(cfg: &Config) -> Result<Box<dyn PacketSource>> {
    if let Some(iface) = &cfg.capture.iface {
        #[cfg(feature = "live")]
        {
            let source = netcap::source::open_live(
                iface,
                cfg.capture.bpf.as_deref(),
                cfg.capture.promisc,
                cfg.capture.snaplen,
            )?;
            return Ok(Box::new(source));
        }
        #[cfg(not(feature = "live"))]
        anyhow::bail!(
            "live capture on {} requires a build with --features live",
            iface
        );
    }

    let path = cfg
        .capture
        .read
        .as_ref()
        .context("no capture file configured")?;

    if let Some(bpf) = &cfg.capture.bpf {
        #[cfg(feature = "live")]
        {
            let source = netcap::source::open_file_with_bpf(path, bpf)?;
            return Ok(Box::new(source));
        }
        #[cfg(not(feature = "live"))]
        anyhow::bail!(
            "BPF filter {:?} requires a build with --features live",
            bpf
        );
    }

    let source = netcap::source::open_capture_file(path)?;
    Ok(Box::new(source))
}
