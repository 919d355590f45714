//! Capture file sources.
//!
//! Classic pcap and pcapng readers over `pcap-parser`, with magic-byte
//! format detection. Both preserve capture order and surface timestamps
//! in nanoseconds regardless of the file's native resolution.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{
    Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader,
};
use tracing::{debug, warn};

use crate::core::parse::LinkType;
use crate::errors::SourceError;

use super::{PacketSource, RawFrame};

const READER_CAPACITY: usize = 1 << 20;

/// Classic pcap magics, both endiannesses, micro- and nanosecond variants
const PCAP_MAGICS: [[u8; 4]; 4] = [
    [0xa1, 0xb2, 0xc3, 0xd4],
    [0xd4, 0xc3, 0xb2, 0xa1],
    [0xa1, 0xb2, 0x3c, 0x4d],
    [0x4d, 0x3c, 0xb2, 0xa1],
];

/// pcapng section header block type
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// On-disk capture format, detected from the first four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

/// Detect the capture format of a file by magic bytes.
pub fn detect_format(path: &Path) -> Result<CaptureFormat, SourceError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| SourceError::TooShort(0))?;

    if magic == PCAPNG_MAGIC {
        Ok(CaptureFormat::PcapNg)
    } else if PCAP_MAGICS.contains(&magic) {
        Ok(CaptureFormat::Pcap)
    } else {
        Err(SourceError::Unreadable {
            path: path.to_path_buf(),
            reason: format!("unknown capture magic {:02x?}", magic),
        })
    }
}

/// Open a capture file, auto-detecting the format.
pub fn open_capture_file(path: &Path) -> Result<FileSource, SourceError> {
    let format = detect_format(path)?;
    debug!("opening {} as {:?}", path.display(), format);

    let file = File::open(path)?;
    let reader = BufReader::with_capacity(256 * 1024, file);

    let unreadable = |e: String| SourceError::Unreadable {
        path: path.to_path_buf(),
        reason: e,
    };

    let inner = match format {
        CaptureFormat::Pcap => Inner::Legacy(
            LegacyPcapReader::new(READER_CAPACITY, reader)
                .map_err(|e| unreadable(format!("{:?}", e)))?,
        ),
        CaptureFormat::PcapNg => Inner::Ng(
            PcapNGReader::new(READER_CAPACITY, reader)
                .map_err(|e| unreadable(format!("{:?}", e)))?,
        ),
    };

    Ok(FileSource {
        name: path.display().to_string(),
        path: path.to_path_buf(),
        inner,
        link: LinkType::Ethernet,
        ts_units_per_sec: 1_000_000,
        done: false,
    })
}

enum Inner {
    Legacy(LegacyPcapReader<BufReader<File>>),
    Ng(PcapNGReader<BufReader<File>>),
}

/// A capture file yielding frames in capture order.
pub struct FileSource {
    name: String,
    path: PathBuf,
    inner: Inner,
    link: LinkType,
    /// Timestamp units per second of the current section/interface.
    /// Classic nanosecond-magic files set this to 1e9.
    ts_units_per_sec: u64,
    done: bool,
}

/// Raw capture timestamp before resolution is applied.
enum RawTs {
    /// 64-bit counter in interface timestamp units (pcapng)
    Units(u64),
    /// Seconds plus fractional part in file units (classic pcap)
    SecFrac(u32, u32),
}

/// One parsing step. Interface/section blocks update reader state,
/// packet blocks carry a frame in file-native timestamp units.
enum Step {
    Packet {
        ts: RawTs,
        data: Vec<u8>,
        wire_len: u32,
    },
    Interface {
        linktype: i32,
        ts_units_per_sec: u64,
    },
    Skip,
    Refill,
    Eof,
    Error(String),
}

impl FileSource {
    fn apply_interface(&mut self, linktype: i32, ts_units_per_sec: u64) {
        self.ts_units_per_sec = ts_units_per_sec.max(1);
        self.link = match linktype {
            1 => LinkType::Ethernet,
            12 | 14 | 101 => LinkType::RawIp,
            other => {
                warn!(
                    "{}: unsupported link type {}, decoding as ethernet",
                    self.path.display(),
                    other
                );
                LinkType::Ethernet
            }
        };
    }

    fn ns_from(&self, ts: RawTs) -> i64 {
        let per_sec = self.ts_units_per_sec;
        let (secs, frac) = match ts {
            RawTs::Units(units) => (units / per_sec, units % per_sec),
            RawTs::SecFrac(sec, frac) => (sec as u64, frac as u64),
        };
        (secs as i64) * 1_000_000_000
            + (frac as i64) * (1_000_000_000 / per_sec as i64)
    }
}

impl PacketSource for FileSource {
    fn next(&mut self) -> Result<Option<RawFrame>, SourceError> {
        if self.done {
            return Ok(None);
        }

        loop {
            let step = match &mut self.inner {
                Inner::Legacy(reader) => next_legacy(reader),
                Inner::Ng(reader) => next_ng(reader),
            };

            match step {
                Step::Packet { ts, data, wire_len } => {
                    let ts = self.ns_from(ts);
                    let cap_len = data.len() as u32;
                    return Ok(Some(RawFrame {
                        data,
                        ts,
                        cap_len,
                        wire_len,
                        link: self.link,
                    }));
                }
                Step::Interface { linktype, ts_units_per_sec } => {
                    self.apply_interface(linktype, ts_units_per_sec);
                }
                Step::Skip => {}
                Step::Refill => {
                    let refilled = match &mut self.inner {
                        Inner::Legacy(reader) => reader.refill(),
                        Inner::Ng(reader) => reader.refill(),
                    };
                    if refilled.is_err() {
                        self.done = true;
                        return Ok(None);
                    }
                }
                Step::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                Step::Error(reason) => {
                    self.done = true;
                    return Err(SourceError::Unreadable {
                        path: self.path.clone(),
                        reason,
                    });
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn next_legacy(reader: &mut LegacyPcapReader<BufReader<File>>) -> Step {
    match reader.next() {
        Ok((offset, block)) => {
            let step = match block {
                PcapBlockOwned::LegacyHeader(hdr) => {
                    let nanos = hdr.magic_number == 0xa1b2_3c4d
                        || hdr.magic_number == 0x4d3c_b2a1;
                    Step::Interface {
                        linktype: hdr.network.0,
                        ts_units_per_sec: if nanos {
                            1_000_000_000
                        } else {
                            1_000_000
                        },
                    }
                }
                PcapBlockOwned::Legacy(pkt) => Step::Packet {
                    // ts_usec holds nanoseconds in nanosecond-magic files;
                    // the resolution recorded from the header applies
                    ts: RawTs::SecFrac(pkt.ts_sec, pkt.ts_usec),
                    data: pkt.data.to_vec(),
                    wire_len: pkt.origlen,
                },
                PcapBlockOwned::NG(_) => Step::Skip,
            };
            reader.consume(offset);
            step
        }
        Err(PcapError::Eof) => Step::Eof,
        Err(PcapError::Incomplete(_)) => Step::Refill,
        Err(e) => Step::Error(format!("{:?}", e)),
    }
}

fn next_ng(reader: &mut PcapNGReader<BufReader<File>>) -> Step {
    match reader.next() {
        Ok((offset, block)) => {
            let step = match block {
                PcapBlockOwned::NG(Block::SectionHeader(_)) => Step::Skip,
                PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                    // if_tsresol (option 9): high bit picks base 2 vs 10
                    let mut units = 1_000_000u64;
                    for opt in &idb.options {
                        if opt.code.0 == 9 {
                            if let Some(&v) = opt.value.first() {
                                units = if v & 0x80 == 0 {
                                    10u64.saturating_pow((v & 0x7f) as u32)
                                } else {
                                    2u64.saturating_pow((v & 0x7f) as u32)
                                };
                            }
                        }
                    }
                    Step::Interface {
                        linktype: idb.linktype.0,
                        ts_units_per_sec: units,
                    }
                }
                PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                    let units =
                        ((epb.ts_high as u64) << 32) | (epb.ts_low as u64);
                    let caplen =
                        (epb.caplen as usize).min(epb.data.len());
                    Step::Packet {
                        ts: RawTs::Units(units),
                        data: epb.data[..caplen].to_vec(),
                        wire_len: epb.origlen,
                    }
                }
                PcapBlockOwned::NG(Block::SimplePacket(spb)) => Step::Packet {
                    ts: RawTs::Units(0),
                    data: spb.data.to_vec(),
                    wire_len: spb.origlen,
                },
                _ => Step::Skip,
            };
            reader.consume(offset);
            step
        }
        Err(PcapError::Eof) => Step::Eof,
        Err(PcapError::Incomplete(_)) => Step::Refill,
        Err(e) => Step::Error(format!("{:?}", e)),
    }
}
