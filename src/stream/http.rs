//! HTTP stream decoder.
//!
//! A peer of the POP3 reader, reduced to what the extraction pipeline
//! needs: request lines and headers on the client side, status lines,
//! headers and bodies on the server side. Response bodies are delimited
//! by Content-Length (or stream end) and handed to file extraction with
//! their transport encoding. Chunked transfer encoding is not decoded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::core::records::{PacketContext, Record, RecordType};

use super::extract::{save_file, ExtractContext};
use super::reader::{ReadStatus, Role, StreamReader};
use super::{
    HalfFlags, StreamContext, StreamDecoder, StreamHandles, StreamRuntime,
};

#[derive(Debug, Clone, Default)]
struct HttpRequest {
    method: String,
    uri: String,
    host: String,
}

#[derive(Debug, Clone, Default)]
struct HttpResponse {
    status: u16,
    content_encoding: Vec<String>,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Exchange {
    requests: Vec<HttpRequest>,
    responses: Vec<HttpResponse>,
}

pub struct HttpDecoder;

impl StreamDecoder for HttpDecoder {
    fn name(&self) -> &'static str {
        "http"
    }

    fn record_type(&self) -> RecordType {
        RecordType::File
    }

    fn server_ports(&self) -> &'static [u16] {
        &[80, 8080]
    }

    fn can_match(&self, prefix: &[u8]) -> bool {
        const METHODS: [&[u8]; 7] = [
            b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ",
            b"HTTP/1.",
        ];
        METHODS.iter().any(|m| prefix.starts_with(m))
    }

    fn start(
        &self,
        ctx: StreamContext,
        runtime: Arc<StreamRuntime>,
    ) -> StreamHandles {
        let depth = runtime.config.stream.stream_buffer_size;
        let (c2s_tx, c2s_rx) = bounded::<Vec<u8>>(depth);
        let (s2c_tx, s2c_rx) = bounded::<Vec<u8>>(depth);
        let c2s_flags = Arc::new(HalfFlags::default());
        let s2c_flags = Arc::new(HalfFlags::default());

        let session = Arc::new(HttpSession {
            ctx,
            runtime,
            exchange: Mutex::new(Exchange::default()),
            sides_remaining: AtomicUsize::new(2),
        });

        let deadline =
            Duration::from_secs(session.runtime.config.decode.flow_timeout);

        let mut joins = Vec::with_capacity(2);
        for (role, rx, flags) in [
            (Role::Client, c2s_rx, c2s_flags.clone()),
            (Role::Server, s2c_rx, s2c_flags.clone()),
        ] {
            let session = session.clone();
            let reader = StreamReader::new(
                session.ctx.ident.clone(),
                role,
                rx,
                flags,
                deadline,
            );
            let handle = std::thread::Builder::new()
                .name(format!("http-{:?}", role).to_lowercase())
                .spawn(move || session.run(reader))
                .expect("spawn stream reader thread");
            joins.push(handle);
        }

        StreamHandles {
            c2s_tx: Some(c2s_tx),
            s2c_tx: Some(s2c_tx),
            c2s_flags,
            s2c_flags,
            joins,
        }
    }
}

struct HttpSession {
    ctx: StreamContext,
    runtime: Arc<StreamRuntime>,
    exchange: Mutex<Exchange>,
    sides_remaining: AtomicUsize,
}

impl HttpSession {
    fn run(&self, mut reader: StreamReader) {
        loop {
            let more = match reader.role() {
                Role::Client => self.read_request(&mut reader),
                Role::Server => self.read_response(&mut reader),
            };
            if !more {
                break;
            }
        }
        self.cleanup();
    }

    /// Parse one request: request line, headers, optional body (skipped).
    fn read_request(&self, reader: &mut StreamReader) -> bool {
        let line = match reader.read_line() {
            Ok(line) if !line.is_empty() => line,
            Ok(_) => return true,
            Err(_) => return false,
        };

        let mut parts = line.split_whitespace();
        let (Some(method), Some(uri)) = (parts.next(), parts.next()) else {
            trace!("{}: not a request line: {}", reader.ident(), line);
            return true;
        };

        let Some(headers) = read_headers(reader) else {
            return false;
        };
        let host = headers.get("host").cloned().unwrap_or_default();

        // uploads are not reconstructed, but the body must be consumed
        if let Some(length) = content_length(&headers) {
            let (_, status) = reader.read_count(length);
            if status.is_terminal() {
                return false;
            }
        }

        debug!("{}: {} {}", reader.ident(), method, uri);
        self.exchange.lock().requests.push(HttpRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            host,
        });
        true
    }

    /// Parse one response: status line, headers, body.
    fn read_response(&self, reader: &mut StreamReader) -> bool {
        let line = match reader.read_line() {
            Ok(line) if !line.is_empty() => line,
            Ok(_) => return true,
            Err(_) => return false,
        };

        if !line.starts_with("HTTP/") {
            trace!("{}: not a status line: {}", reader.ident(), line);
            return true;
        }
        let status = line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .unwrap_or(0);

        let Some(headers) = read_headers(reader) else {
            return false;
        };
        let content_encoding: Vec<String> = headers
            .get("content-encoding")
            .map(|v| v.split(',').map(|e| e.trim().to_string()).collect())
            .unwrap_or_default();

        let (body, terminal) = match content_length(&headers) {
            Some(length) => {
                let (body, status) = reader.read_count(length);
                (body, status.is_terminal())
            }
            // no length: the body runs to the end of the stream
            None => {
                let (body, _) = reader.read_to_end();
                (body, true)
            }
        };

        self.exchange.lock().responses.push(HttpResponse {
            status,
            content_encoding,
            body,
        });
        !terminal
    }

    fn cleanup(&self) {
        if self.sides_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let Some(storage) =
            self.runtime.config.stream.file_storage.clone()
        else {
            return;
        };

        let meta = self.runtime.conn_tracker.meta(self.ctx.handle);
        let timestamp = meta
            .as_ref()
            .map(|m| m.timestamp_first)
            .unwrap_or(self.ctx.first_ts);

        let exchange = self.exchange.lock();
        for (i, response) in exchange.responses.iter().enumerate() {
            if response.body.is_empty() {
                continue;
            }

            let name = exchange
                .requests
                .get(i)
                .map(|r| basename(&r.uri))
                .unwrap_or_else(|| "unknown".to_string());

            let packet_context = if self.runtime.config.output.context {
                PacketContext {
                    src_ip: self.ctx.client_ip.clone(),
                    dst_ip: self.ctx.server_ip.clone(),
                    src_port: self.ctx.client_port.clone(),
                    dst_port: self.ctx.server_port.clone(),
                }
            } else {
                PacketContext::default()
            };
            let ctx = ExtractContext {
                storage_root: &storage,
                ident: &self.ctx.ident,
                source: "HTTP",
                timestamp,
                packet_context,
            };

            match save_file(
                &ctx,
                &name,
                &response.body,
                &response.content_encoding,
            ) {
                Ok(Some(record)) => {
                    debug!(
                        "{}: extracted {} (status {})",
                        self.ctx.ident, record.name, response.status
                    );
                    if let Err(e) =
                        self.runtime.writers.write(&Record::File(record))
                    {
                        error!("failed to write File record: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "{}: failed to extract body: {}",
                        self.ctx.ident, e
                    );
                }
            }
        }
    }
}

/// Read headers up to the empty line. Returns None when the stream ends
/// mid-headers.
fn read_headers(reader: &mut StreamReader) -> Option<HashMap<String, String>> {
    let mut headers = HashMap::new();
    loop {
        match reader.read_line() {
            Ok(line) if line.is_empty() => return Some(headers),
            Ok(line) => {
                if let Some((name, value)) = line.split_once(':') {
                    headers.insert(
                        name.trim().to_lowercase(),
                        value.trim().to_string(),
                    );
                }
            }
            Err(ReadStatus::Eof) if !headers.is_empty() => {
                return Some(headers)
            }
            Err(_) => return None,
        }
    }
}

fn content_length(headers: &HashMap<String, String>) -> Option<usize> {
    headers.get("content-length")?.parse().ok()
}

/// Last path component of a request URI, without the query string.
fn basename(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let base = path.rsplit('/').next().unwrap_or("");
    if base.is_empty() {
        "index".to_string()
    } else {
        base.to_string()
    }
}
