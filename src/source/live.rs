//! libpcap-backed sources (feature `live`).
//!
//! Live capture from a named interface and the filtered file path: BPF
//! expressions are only available through libpcap, so `--read` combined
//! with `--bpf` also goes through this module.

use std::path::Path;

use pcap::{Activated, Capture};
use tracing::{debug, info};

use crate::core::parse::LinkType;
use crate::errors::SourceError;

use super::{PacketSource, RawFrame};

/// A libpcap capture handle, live or offline.
pub struct LiveSource {
    name: String,
    capture: Capture<dyn Activated>,
    link: LinkType,
}

/// Open a live capture on the named interface.
pub fn open_live(
    iface: &str,
    bpf: Option<&str>,
    promisc: bool,
    snaplen: i32,
) -> Result<LiveSource, SourceError> {
    let capture = Capture::from_device(iface)
        .map_err(|e| SourceError::Transient(e.to_string()))?
        .promisc(promisc)
        .snaplen(snaplen)
        .timeout(100)
        .open()
        .map_err(|e| SourceError::Transient(e.to_string()))?;

    info!("live capture on {} (promisc={})", iface, promisc);
    finish(iface.to_string(), capture.into(), bpf)
}

/// Open a capture file through libpcap so a BPF filter can be applied.
pub fn open_file_with_bpf(
    path: &Path,
    bpf: &str,
) -> Result<LiveSource, SourceError> {
    let capture =
        Capture::from_file(path).map_err(|e| SourceError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    finish(path.display().to_string(), capture.into(), Some(bpf))
}

fn finish(
    name: String,
    mut capture: Capture<dyn Activated>,
    bpf: Option<&str>,
) -> Result<LiveSource, SourceError> {
    if let Some(expr) = bpf {
        capture
            .filter(expr, true)
            .map_err(|e| SourceError::Transient(format!("bad BPF: {}", e)))?;
        debug!("applied BPF filter: {}", expr);
    }

    let link = match capture.get_datalink().0 {
        1 => LinkType::Ethernet,
        12 | 14 | 101 => LinkType::RawIp,
        _ => LinkType::Ethernet,
    };

    Ok(LiveSource {
        name,
        capture,
        link,
    })
}

impl PacketSource for LiveSource {
    fn next(&mut self) -> Result<Option<RawFrame>, SourceError> {
        loop {
            match self.capture.next_packet() {
                Ok(pkt) => {
                    let ts = pkt.header.ts.tv_sec as i64 * 1_000_000_000
                        + pkt.header.ts.tv_usec as i64 * 1_000;
                    return Ok(Some(RawFrame {
                        data: pkt.data.to_vec(),
                        ts,
                        cap_len: pkt.header.caplen,
                        wire_len: pkt.header.len,
                        link: self.link,
                    }));
                }
                // read timeout on a live handle: try again
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => return Ok(None),
                Err(e) => {
                    return Err(SourceError::Transient(e.to_string()));
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
