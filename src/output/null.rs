//! Null writer: accepts everything, writes nothing.

use crate::core::records::{Header, Record};
use crate::errors::WriteError;

use super::AuditWriter;

#[derive(Default)]
pub struct NullWriter;

impl AuditWriter for NullWriter {
    fn write_header(&mut self, _header: &Header) -> Result<(), WriteError> {
        Ok(())
    }

    fn write_record(&mut self, _record: &Record) -> Result<(), WriteError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(String, u64), WriteError> {
        Ok((String::new(), 0))
    }
}
