//! Writer sink.
//!
//! One writer per record type, selected by the output configuration:
//! length-delimited binary (default), CSV, newline-delimited JSON, or
//! null. Writers are serialized internally so the decoders never
//! coordinate; a write failure is fatal for that record type only.

mod csv;
mod delimited;
mod file_utils;
mod json;
mod null;

pub use csv::CsvWriter;
pub use delimited::{read_frames, DelimitedWriter, FILE_EXTENSION};
pub use file_utils::{remove_if_empty, FileSink};
pub use json::JsonWriter;
pub use null::NullWriter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::config::OutputConfig;
use crate::core::records::{Header, Record, RecordStats, RecordType};
use crate::errors::WriteError;

/// Format-level writer contract: header once, records many, close once.
pub trait AuditWriter: Send {
    fn write_header(&mut self, header: &Header) -> Result<(), WriteError>;
    fn write_record(&mut self, record: &Record) -> Result<(), WriteError>;
    fn close(&mut self) -> Result<(String, u64), WriteError>;
}

/// Serialized single-writer-per-type wrapper around a format writer.
pub struct RecordWriter {
    record_type: RecordType,
    inner: Mutex<Box<dyn AuditWriter>>,
    records_written: AtomicU64,
    failed: AtomicBool,
}

impl RecordWriter {
    fn new(record_type: RecordType, inner: Box<dyn AuditWriter>) -> Self {
        Self {
            record_type,
            inner: Mutex::new(inner),
            records_written: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::Relaxed)
    }

    pub fn write_header(&self, header: &Header) -> Result<(), WriteError> {
        self.inner.lock().write_header(header)
    }

    /// Write one record. After the first failure the writer is aborted
    /// and every further write is dropped with a diagnostic.
    pub fn write(&self, record: &Record) -> Result<(), WriteError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(WriteError::Closed(self.record_type.as_str()));
        }
        match self.inner.lock().write_record(record) {
            Ok(()) => {
                self.records_written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.failed.store(true, Ordering::Relaxed);
                error!(
                    "writer for {} aborted: {}",
                    self.record_type.as_str(),
                    e
                );
                Err(e)
            }
        }
    }

    pub fn close(&self) -> Result<(String, u64), WriteError> {
        self.inner.lock().close()
    }
}

/// The full set of writers for one capture run, keyed by record type.
pub struct WriterSet {
    writers: HashMap<RecordType, RecordWriter>,
    pub stats: Arc<RecordStats>,
}

impl WriterSet {
    /// Build one writer per record type and emit the file headers.
    pub fn build(
        cfg: &OutputConfig,
        source: &str,
        start: DateTime<Utc>,
    ) -> Result<Self, WriteError> {
        std::fs::create_dir_all(&cfg.out)?;

        let mut writers = HashMap::new();
        for &record_type in RecordType::all() {
            let inner: Box<dyn AuditWriter> = if cfg.null {
                Box::new(NullWriter::default())
            } else if cfg.csv {
                Box::new(CsvWriter::create(
                    &cfg.out,
                    record_type,
                    cfg.compress,
                    cfg.mem_buffer_size,
                )?)
            } else if cfg.json {
                Box::new(JsonWriter::create(
                    &cfg.out,
                    record_type,
                    cfg.compress,
                    cfg.mem_buffer_size,
                )?)
            } else {
                Box::new(DelimitedWriter::create(
                    &cfg.out,
                    record_type,
                    cfg.compress,
                    cfg.mem_buffer_size,
                )?)
            };

            let writer = RecordWriter::new(record_type, inner);
            writer.write_header(&Header::new(
                record_type,
                source,
                start,
                cfg.include_payloads,
            ))?;
            writers.insert(record_type, writer);
        }

        Ok(Self {
            writers,
            stats: Arc::new(RecordStats::default()),
        })
    }

    /// Route a record to its type's writer. Sink failures abort that
    /// writer; the caller logs and continues.
    pub fn write(&self, record: &Record) -> Result<(), WriteError> {
        let writer = self
            .writers
            .get(&record.record_type())
            .ok_or(WriteError::Closed("unregistered record type"))?;
        writer.write(record)?;
        self.stats.inc(record.record_type());
        Ok(())
    }

    pub fn records_written(&self, record_type: RecordType) -> u64 {
        self.writers
            .get(&record_type)
            .map(|w| w.records_written())
            .unwrap_or(0)
    }

    /// Close every writer, applying the empty-file policy.
    pub fn close_all(&self) -> Vec<(RecordType, String, u64)> {
        let mut results = Vec::new();
        for (&record_type, writer) in &self.writers {
            match writer.close() {
                Ok((name, size)) => {
                    if size > 0 {
                        info!(
                            "wrote {} ({} records, {} bytes)",
                            name,
                            writer.records_written(),
                            size
                        );
                    }
                    results.push((record_type, name, size));
                }
                Err(e) => {
                    error!(
                        "failed to close writer for {}: {}",
                        record_type.as_str(),
                        e
                    );
                }
            }
        }
        results
    }
}
