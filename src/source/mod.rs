//! Packet sources.
//!
//! A source abstracts a live device or a capture file and yields raw
//! frames with a capture timestamp, capture length and link-layer hint.
//! File sources preserve capture order; the two on-disk formats (classic
//! pcap and pcapng) are auto-detected by magic bytes.

mod file;
#[cfg(feature = "live")]
mod live;

pub use file::{open_capture_file, CaptureFormat, FileSource};
#[cfg(feature = "live")]
pub use live::{open_file_with_bpf, open_live, LiveSource};

use crate::core::parse::LinkType;
use crate::errors::SourceError;

/// One captured frame, not yet decoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    /// Capture timestamp in nanoseconds since the epoch
    pub ts: i64,
    /// Bytes captured
    pub cap_len: u32,
    /// Original length on the wire
    pub wire_len: u32,
    pub link: LinkType,
}

/// The single operation every source supports. `Ok(None)` means no more
/// packets; transient conditions on live sources are retried internally.
pub trait PacketSource: Send {
    fn next(&mut self) -> Result<Option<RawFrame>, SourceError>;

    /// Source description (file name or interface) for writer headers
    fn name(&self) -> &str;
}
