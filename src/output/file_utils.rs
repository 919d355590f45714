//! Audit record file handles.
//!
//! Shared plumbing for the format writers: file creation, the
//! buffer/compression stack, and the empty-file policy (a file that holds
//! only a header and no records is deleted on close).

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::errors::WriteError;

enum Stream {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

/// A created audit record file with its buffer/compression stack.
pub struct FileSink {
    path: PathBuf,
    stream: Option<Stream>,
}

impl FileSink {
    /// Create (truncate) the output file `name + ext` below `out`.
    pub fn create(
        out: &Path,
        name: &str,
        ext: &str,
        compress: bool,
        buffer_size: usize,
    ) -> Result<Self, WriteError> {
        let ext = if compress {
            format!("{}.gz", ext)
        } else {
            ext.to_string()
        };
        let path = out.join(format!("{}{}", name, ext));

        let file = File::create(&path).map_err(|source| WriteError::Create {
            path: path.clone(),
            source,
        })?;

        let buffered = BufWriter::with_capacity(buffer_size.max(1), file);
        let stream = if compress {
            Stream::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            Stream::Plain(buffered)
        };

        Ok(Self {
            path,
            stream: Some(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), WriteError> {
        match self.stream.as_mut() {
            Some(Stream::Plain(w)) => w.write_all(data)?,
            Some(Stream::Gzip(w)) => w.write_all(data)?,
            None => return Err(WriteError::Closed("file sink")),
        }
        Ok(())
    }

    /// Flush and close the underlying handles, then apply the empty-file
    /// policy. Returns the final file name and its on-disk size (0 if the
    /// file was removed).
    pub fn close(&mut self, records_written: u64) -> Result<(String, u64), WriteError> {
        match self.stream.take() {
            Some(Stream::Plain(mut w)) => {
                w.flush()?;
            }
            Some(Stream::Gzip(gz)) => {
                let mut inner = gz.finish()?;
                inner.flush()?;
            }
            None => return Err(WriteError::Closed("file sink")),
        }

        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = remove_if_empty(&self.path, records_written);
        Ok((name, size))
    }
}

/// Remove an audit record file that contains no records.
///
/// CSV and JSON files (compressed or not) are judged by line count: fewer
/// than 2 lines means header-only. Binary files are judged by the record
/// counter. Returns the surviving file size, 0 when removed.
pub fn remove_if_empty(path: &Path, records_written: u64) -> u64 {
    let name = path.to_string_lossy();
    let line_based = [".csv", ".csv.gz", ".json", ".json.gz"]
        .iter()
        .any(|ext| name.ends_with(ext));

    let empty = if line_based {
        count_lines(path, 2) < 2
    } else {
        records_written == 0
    };

    if empty {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove empty audit file {}: {}", name, e);
        } else {
            debug!("removed empty audit file {}", name);
        }
        return 0;
    }

    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Count lines up to `limit`, transparently decompressing `.gz` files.
fn count_lines(path: &Path, limit: usize) -> usize {
    let Ok(file) = File::open(path) else {
        return 0;
    };

    let reader: Box<dyn Read> = if path.to_string_lossy().ends_with(".gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    BufReader::new(reader)
        .lines()
        .take(limit)
        .take_while(|l| l.is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_only_csv_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FileSink::create(dir.path(), "Connection", ".csv", false, 4096).unwrap();
        sink.write_all(b"a,b,c\n").unwrap();
        let path = sink.path().to_path_buf();
        let (_, size) = sink.close(0).unwrap();
        assert_eq!(size, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_csv_with_records_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FileSink::create(dir.path(), "Connection", ".csv", false, 4096).unwrap();
        sink.write_all(b"a,b,c\n1,2,3\n").unwrap();
        let path = sink.path().to_path_buf();
        let (name, size) = sink.close(1).unwrap();
        assert_eq!(name, "Connection.csv");
        assert!(size > 0);
        assert!(path.exists());
    }

    #[test]
    fn test_compressed_empty_json_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FileSink::create(dir.path(), "POP3", ".json", true, 4096).unwrap();
        sink.write_all(b"{\"header\":true}\n").unwrap();
        let path = sink.path().to_path_buf();
        assert!(path.to_string_lossy().ends_with(".json.gz"));
        let (_, size) = sink.close(0).unwrap();
        assert_eq!(size, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_binary_judged_by_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FileSink::create(dir.path(), "Flow", ".ncap", false, 4096).unwrap();
        sink.write_all(b"header-bytes").unwrap();
        let path = sink.path().to_path_buf();
        let (_, size) = sink.close(0).unwrap();
        assert_eq!(size, 0);
        assert!(!path.exists());
    }
}
