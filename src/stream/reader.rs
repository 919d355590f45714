//! Stream readers.
//!
//! A `StreamReader` consumes one direction of a reassembled TCP stream
//! from its bounded byte channel. Reads are bounded-wait with an explicit
//! deadline: when no byte arrives within the flow timeout the read
//! returns an eof-like status and the protocol reader tears down.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::HalfFlags;

/// Reader role relative to the connection initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Terminal and non-terminal read outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    Eof,
    InactivityTimeout,
    Overflow,
}

impl ReadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadStatus::Ok)
    }
}

/// One direction of a reassembled stream.
pub struct StreamReader {
    ident: String,
    role: Role,
    rx: Receiver<Vec<u8>>,
    flags: Arc<HalfFlags>,
    deadline: Duration,
    buf: Vec<u8>,
    pos: usize,
    terminal: Option<ReadStatus>,
}

impl StreamReader {
    pub fn new(
        ident: String,
        role: Role,
        rx: Receiver<Vec<u8>>,
        flags: Arc<HalfFlags>,
        deadline: Duration,
    ) -> Self {
        Self {
            ident,
            role,
            rx,
            flags,
            deadline,
            buf: Vec::new(),
            pos: 0,
            terminal: None,
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Read up to `out.len()` bytes. Returns the byte count and status;
    /// a count of 0 always comes with a terminal status.
    pub fn read(&mut self, out: &mut [u8]) -> (usize, ReadStatus) {
        if self.buffered().is_empty() {
            if let Err(status) = self.fill() {
                return (0, status);
            }
        }
        let available = self.buffered();
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        (n, ReadStatus::Ok)
    }

    /// Read one CRLF-terminated line (LF accepted), without the line
    /// ending. A partial line at stream end is returned before the
    /// terminal status.
    pub fn read_line(&mut self) -> Result<String, ReadStatus> {
        loop {
            if let Some(idx) =
                self.buffered().iter().position(|&b| b == b'\n')
            {
                let line = &self.buffered()[..idx];
                let line = match line.strip_suffix(b"\r") {
                    Some(stripped) => stripped,
                    None => line,
                };
                let text = String::from_utf8_lossy(line).into_owned();
                self.pos += idx + 1;
                return Ok(text);
            }

            if let Err(status) = self.fill() {
                if self.buffered().is_empty() {
                    return Err(status);
                }
                let text =
                    String::from_utf8_lossy(self.buffered()).into_owned();
                self.pos = self.buf.len();
                return Ok(text);
            }
        }
    }

    /// Read exactly `n` bytes, or fewer if the stream terminates first.
    pub fn read_count(&mut self, n: usize) -> (Vec<u8>, ReadStatus) {
        let mut out = Vec::with_capacity(n.min(1 << 20));
        while out.len() < n {
            if self.buffered().is_empty() {
                if let Err(status) = self.fill() {
                    return (out, status);
                }
            }
            let available = self.buffered();
            let take = available.len().min(n - out.len());
            out.extend_from_slice(&available[..take]);
            self.pos += take;
        }
        (out, ReadStatus::Ok)
    }

    /// Read until the stream terminates. Returns the bytes and the
    /// terminal status.
    pub fn read_to_end(&mut self) -> (Vec<u8>, ReadStatus) {
        let mut out = Vec::new();
        loop {
            if self.buffered().is_empty() {
                if let Err(status) = self.fill() {
                    return (out, status);
                }
            }
            out.extend_from_slice(self.buffered());
            self.pos = self.buf.len();
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Block on the channel until the next chunk or the deadline.
    fn fill(&mut self) -> Result<(), ReadStatus> {
        if let Some(status) = self.terminal {
            return Err(status);
        }

        match self.rx.recv_timeout(self.deadline) {
            Ok(chunk) => {
                // compact the consumed prefix, keep any partial line
                if self.pos > 0 {
                    self.buf.drain(..self.pos);
                    self.pos = 0;
                }
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                let status = ReadStatus::InactivityTimeout;
                self.terminal = Some(status);
                Err(status)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = if self.flags.overflowed() {
                    ReadStatus::Overflow
                } else {
                    ReadStatus::Eof
                };
                self.terminal = Some(status);
                Err(status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn reader(
        chunks: Vec<&[u8]>,
    ) -> (StreamReader, crossbeam_channel::Sender<Vec<u8>>) {
        let (tx, rx) = bounded(16);
        for chunk in chunks {
            tx.send(chunk.to_vec()).unwrap();
        }
        let reader = StreamReader::new(
            "10.0.0.1:4000-10.0.0.2:110".into(),
            Role::Client,
            rx,
            Arc::new(HalfFlags::default()),
            Duration::from_millis(50),
        );
        (reader, tx)
    }

    #[test]
    fn test_read_line_across_chunks() {
        let (mut r, tx) = reader(vec![b"USER al", b"ice\r\nPASS s3cret\r\n"]);
        drop(tx);
        assert_eq!(r.read_line().unwrap(), "USER alice");
        assert_eq!(r.read_line().unwrap(), "PASS s3cret");
        assert_eq!(r.read_line().unwrap_err(), ReadStatus::Eof);
    }

    #[test]
    fn test_partial_line_before_eof() {
        let (mut r, tx) = reader(vec![b"QUIT"]);
        drop(tx);
        assert_eq!(r.read_line().unwrap(), "QUIT");
        assert_eq!(r.read_line().unwrap_err(), ReadStatus::Eof);
    }

    #[test]
    fn test_inactivity_timeout() {
        let (mut r, _tx) = reader(vec![]);
        assert_eq!(r.read_line().unwrap_err(), ReadStatus::InactivityTimeout);
        // terminal status is sticky
        assert_eq!(r.read_line().unwrap_err(), ReadStatus::InactivityTimeout);
    }

    #[test]
    fn test_overflow_status() {
        let (tx, rx) = bounded(1);
        let flags = Arc::new(HalfFlags::default());
        flags.set_overflowed();
        drop(tx);
        let mut r = StreamReader::new(
            "i".into(),
            Role::Server,
            rx,
            flags,
            Duration::from_millis(50),
        );
        assert_eq!(r.read_line().unwrap_err(), ReadStatus::Overflow);
    }

    #[test]
    fn test_read_count_and_to_end() {
        let (mut r, tx) = reader(vec![b"abcdef", b"ghij"]);
        drop(tx);
        let (head, status) = r.read_count(4);
        assert_eq!(head, b"abcd");
        assert_eq!(status, ReadStatus::Ok);
        let (rest, status) = r.read_to_end();
        assert_eq!(rest, b"efghij");
        assert!(status.is_terminal());
    }
}
