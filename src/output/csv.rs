//! CSV audit record writer.
//!
//! One header row, then one row per record. Field values are sanitized so
//! a record can never break the row structure.

use std::path::Path;

use crate::core::records::{Header, Record, RecordType};
use crate::errors::WriteError;

use super::file_utils::FileSink;
use super::AuditWriter;

pub struct CsvWriter {
    record_type: RecordType,
    sink: FileSink,
    records: u64,
}

impl CsvWriter {
    pub fn create(
        out: &Path,
        record_type: RecordType,
        compress: bool,
        buffer_size: usize,
    ) -> Result<Self, WriteError> {
        let sink = FileSink::create(
            out,
            record_type.as_str(),
            ".csv",
            compress,
            buffer_size,
        )?;
        Ok(Self {
            record_type,
            sink,
            records: 0,
        })
    }
}

impl AuditWriter for CsvWriter {
    fn write_header(&mut self, _header: &Header) -> Result<(), WriteError> {
        let mut row = Record::csv_header(self.record_type).join(",");
        row.push('\n');
        self.sink.write_all(row.as_bytes())
    }

    fn write_record(&mut self, record: &Record) -> Result<(), WriteError> {
        let mut row = record
            .csv_record()
            .iter()
            .map(|field| sanitize(field))
            .collect::<Vec<_>>()
            .join(",");
        row.push('\n');
        self.sink.write_all(row.as_bytes())?;
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(String, u64), WriteError> {
        self.sink.close(self.records)
    }
}

/// Strip separators and line breaks out of a field value.
fn sanitize(field: &str) -> String {
    if field.contains(',') || field.contains('\n') || field.contains('\r') {
        field
            .chars()
            .map(|c| match c {
                ',' => ';',
                '\n' | '\r' => ' ',
                other => other,
            })
            .collect()
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::records::ConnectionRecord;
    use chrono::Utc;

    #[test]
    fn test_csv_writer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut w =
            CsvWriter::create(dir.path(), RecordType::Connection, false, 4096)
                .unwrap();
        let header =
            Header::new(RecordType::Connection, "test.pcap", Utc::now(), false);
        w.write_header(&header).unwrap();
        w.write_record(&Record::Connection(ConnectionRecord {
            uid: "abc".into(),
            num_packets: 2,
            ..Default::default()
        }))
        .unwrap();
        let (name, size) = w.close().unwrap();
        assert_eq!(name, "Connection.csv");
        assert!(size > 0);

        let content =
            std::fs::read_to_string(dir.path().join("Connection.csv")).unwrap();
        let mut lines = content.lines();
        assert!(lines.next().unwrap().starts_with("timestamp_first,"));
        assert!(lines.next().unwrap().contains("abc"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a,b\nc"), "a;b c");
        assert_eq!(sanitize("plain"), "plain");
    }
}
