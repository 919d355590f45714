//! Length-delimited binary audit record writer.
//!
//! The native on-disk format: a header frame followed by one frame per
//! record. Each frame is a big-endian u32 byte length followed by the
//! serialized message.

use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crate::core::records::{Header, Record, RecordType};
use crate::errors::WriteError;

use super::file_utils::FileSink;
use super::AuditWriter;

/// File extension of the native format
pub const FILE_EXTENSION: &str = ".ncap";

pub struct DelimitedWriter {
    sink: FileSink,
    records: u64,
}

impl DelimitedWriter {
    pub fn create(
        out: &Path,
        record_type: RecordType,
        compress: bool,
        buffer_size: usize,
    ) -> Result<Self, WriteError> {
        let sink = FileSink::create(
            out,
            record_type.as_str(),
            FILE_EXTENSION,
            compress,
            buffer_size,
        )?;
        Ok(Self { sink, records: 0 })
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<(), WriteError> {
        let mut prefix = [0u8; 4];
        BigEndian::write_u32(&mut prefix, payload.len() as u32);
        self.sink.write_all(&prefix)?;
        self.sink.write_all(payload)
    }
}

impl AuditWriter for DelimitedWriter {
    fn write_header(&mut self, header: &Header) -> Result<(), WriteError> {
        let payload = serde_json::to_vec(header)?;
        self.write_frame(&payload)
    }

    fn write_record(&mut self, record: &Record) -> Result<(), WriteError> {
        let payload = serde_json::to_vec(record)?;
        self.write_frame(&payload)?;
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(String, u64), WriteError> {
        self.sink.close(self.records)
    }
}

/// Read back all frames of a delimited file (test and tooling support).
pub fn read_frames(data: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let len = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;
        if pos + len > data.len() {
            break;
        }
        frames.push(data[pos..pos + len].to_vec());
        pos += len;
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::records::FileRecord;
    use chrono::Utc;

    #[test]
    fn test_delimited_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut w =
            DelimitedWriter::create(dir.path(), RecordType::File, false, 4096)
                .unwrap();
        w.write_header(&Header::new(
            RecordType::File,
            "test.pcap",
            Utc::now(),
            false,
        ))
        .unwrap();
        w.write_record(&Record::File(FileRecord {
            name: "mail.txt".into(),
            length: 12,
            ..Default::default()
        }))
        .unwrap();
        let (name, _) = w.close().unwrap();
        assert_eq!(name, "File.ncap");

        let data = std::fs::read(dir.path().join("File.ncap")).unwrap();
        let frames = read_frames(&data);
        assert_eq!(frames.len(), 2);

        let header: Header = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(header.record_type, RecordType::File);

        let record: Record = serde_json::from_slice(&frames[1]).unwrap();
        match record {
            Record::File(f) => assert_eq!(f.name, "mail.txt"),
            other => panic!("unexpected record: {:?}", other),
        }
    }
}
