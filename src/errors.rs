//! Error taxonomy for the capture pipeline.
//!
//! Errors surface at the boundary that can act on them: per-packet decode
//! failures stay in the decode loop, write failures are fatal for the
//! affected record type, source failures stop ingest and trigger the
//! final flush.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetcapError>;

/// Top-level error for the capture pipeline.
#[derive(Debug, Error)]
pub enum NetcapError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),

    #[error("config error: {0}")]
    Config(String),

    /// Resolver failures never reach callers; the facade degrades to
    /// unknown answers. The variant exists for completeness.
    #[error("resolver error: {0}")]
    Resolver(String),
}

/// Errors produced by a packet source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source closed")]
    Closed,

    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unreadable capture file {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("transient i/o: {0}")]
    Transient(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-packet decode failures. Counted and skipped, never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("bad {layer} layer: {reason}")]
    BadLayer { layer: &'static str, reason: String },

    #[error("{layer} checksum mismatch")]
    Checksum { layer: &'static str },
}

/// Per-stream failures. The affected stream is closed with a truncated
/// mark; the rest of the pipeline continues.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("sequence gap persisted past the close-pending timeout")]
    GapTimeout,

    #[error("stream buffer overflowed")]
    Overflow,

    #[error("tcp state violation: {0}")]
    FsmViolation(String),
}

/// Sink failures. Fatal for the affected record type.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("writer for {0} already closed")]
    Closed(&'static str),
}
