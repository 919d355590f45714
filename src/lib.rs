//! Netcap: a traffic analysis framework.
//!
//! Turns a packet source (live interface or capture file) into a stream
//! of typed, structured audit records: one record type per protocol,
//! connection, flow or reconstructed application-layer event.
//!
//! # Pipeline
//!
//! ```text
//! Packet Source ──▶ Collector ──▶ worker shards (by flow hash)
//!                                    │
//!                     ┌──────────────┼──────────────┐
//!                     ▼              ▼              ▼
//!               Flow Tracker   Conn Tracker   TCP Reassembler
//!                     │              │              │
//!                     │              │        Stream Readers
//!                     │              │        (POP3, HTTP, …)
//!                     └──────────────┴──────────────┘
//!                                    ▼
//!                              Writer Sink
//!                    (binary / csv / json / null)
//! ```

pub mod collect;
pub mod config;
pub mod core;
pub mod decoder;
pub mod errors;
pub mod output;
pub mod resolver;
pub mod source;
pub mod stream;

pub use collect::{Collector, RunSummary};
pub use config::Config;
pub use errors::{NetcapError, Result};
