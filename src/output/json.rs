//! Newline-delimited JSON audit record writer.
//!
//! The first line is the header object, every following line one record.

use std::path::Path;

use crate::core::records::{Header, Record, RecordType};
use crate::errors::WriteError;

use super::file_utils::FileSink;
use super::AuditWriter;

pub struct JsonWriter {
    sink: FileSink,
    records: u64,
}

impl JsonWriter {
    pub fn create(
        out: &Path,
        record_type: RecordType,
        compress: bool,
        buffer_size: usize,
    ) -> Result<Self, WriteError> {
        let sink = FileSink::create(
            out,
            record_type.as_str(),
            ".json",
            compress,
            buffer_size,
        )?;
        Ok(Self { sink, records: 0 })
    }

    fn write_line(&mut self, json: String) -> Result<(), WriteError> {
        let mut line = json;
        line.push('\n');
        self.sink.write_all(line.as_bytes())
    }
}

impl AuditWriter for JsonWriter {
    fn write_header(&mut self, header: &Header) -> Result<(), WriteError> {
        let json = serde_json::to_string(header)?;
        self.write_line(json)
    }

    fn write_record(&mut self, record: &Record) -> Result<(), WriteError> {
        let json = serde_json::to_string(record)?;
        self.write_line(json)?;
        self.records += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(String, u64), WriteError> {
        self.sink.close(self.records)
    }
}
