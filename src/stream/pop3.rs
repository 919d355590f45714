//! POP3 stream decoder.
//!
//! Runs a line-oriented reader per direction, collects the command and
//! response transcript, and reconstructs the session once both sides
//! have closed: authentication, credentials, and every mail retrieved
//! with RETR. One audit record per connection, emitted exactly once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::core::records::{
    MailMessage, PacketContext, Pop3Record, Record, RecordType,
};

use super::extract::{save_file, ExtractContext};
use super::mail::parse_mail;
use super::reader::{ReadStatus, Role, StreamReader};
use super::{
    HalfFlags, StreamContext, StreamDecoder, StreamHandles, StreamRuntime,
};

/// One client command line.
#[derive(Debug, Clone, Default)]
pub struct Pop3Request {
    pub command: String,
    pub argument: String,
}

/// One server line: a recognized token with its message, or a free-form
/// message line with an empty command.
#[derive(Debug, Clone, Default)]
pub struct Pop3Response {
    pub command: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Transcript {
    pub requests: Vec<Pop3Request>,
    pub responses: Vec<Pop3Response>,
}

/// POP3 session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    NotAuthenticated,
    Authenticated,
    DataTransfer,
    Closed,
}

pub struct Pop3Decoder;

impl StreamDecoder for Pop3Decoder {
    fn name(&self) -> &'static str {
        "pop3"
    }

    fn record_type(&self) -> RecordType {
        RecordType::Pop3
    }

    fn server_ports(&self) -> &'static [u16] {
        &[110]
    }

    fn can_match(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(b"+OK")
            || prefix.starts_with(b"USER ")
            || prefix.starts_with(b"CAPA")
            || prefix.starts_with(b"APOP ")
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

        let session = Arc::new(Pop3Session {
            ctx,
            runtime,
            transcript: Mutex::new(Transcript::default()),
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
                .name(format!("pop3-{:?}", role).to_lowercase())
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

struct Pop3Session {
    ctx: StreamContext,
    runtime: Arc<StreamRuntime>,
    transcript: Mutex<Transcript>,
    /// Cleanup latch: run() finishes once per direction, the side that
    /// decrements this to zero performs record emission so both halves'
    /// transcripts are present.
    sides_remaining: AtomicUsize,
}

impl Pop3Session {
    fn run(&self, mut reader: StreamReader) {
        loop {
            match reader.read_line() {
                Ok(line) => {
                    trace!("{} {:?}: {}", reader.ident(), reader.role(), line);
                    let stop = match reader.role() {
                        Role::Client => self.on_request(&line),
                        Role::Server => self.on_response(&line),
                    };
                    if stop {
                        break;
                    }
                }
                Err(status) => {
                    if status != ReadStatus::Eof {
                        debug!(
                            "{} {:?} reader closing: {:?}",
                            reader.ident(),
                            reader.role(),
                            status
                        );
                    }
                    break;
                }
            }
        }
        self.cleanup();
    }

    fn on_request(&self, line: &str) -> bool {
        let (command, argument) = split_command(line);
        let quit = command == "QUIT";
        self.transcript.lock().requests.push(Pop3Request {
            command,
            argument,
        });
        quit
    }

    fn on_response(&self, line: &str) -> bool {
        let (command, message) = split_command(line);
        let mut transcript = self.transcript.lock();
        if is_server_token(&command) {
            transcript.responses.push(Pop3Response { command, message });
        } else {
            transcript.responses.push(Pop3Response {
                command: String::new(),
                message: line.to_string(),
            });
        }
        drop(transcript);

        line == "-ERR authentication failed" || line.contains("signing off")
    }

    /// Called once per direction; emission happens on the second call.
    fn cleanup(&self) {
        if self.sides_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let (mails, user, pass, token, raw_mails) = self.parse_transcript();

        // parent metadata through the tracker handle, with the stream's
        // own observations as fallback
        let meta = self.runtime.conn_tracker.meta(self.ctx.handle);
        let timestamp = meta
            .as_ref()
            .map(|m| m.timestamp_first)
            .unwrap_or(self.ctx.first_ts);

        let record = Pop3Record {
            timestamp,
            client: self.ctx.client_ip.clone(),
            server: self.ctx.server_ip.clone(),
            auth_token: token,
            user,
            pass,
            mails,
        };

        if let Some(name) =
            self.runtime.resolver.reverse_dns(
                self.ctx
                    .server_ip
                    .parse()
                    .unwrap_or(std::net::IpAddr::from([0u8, 0, 0, 0])),
            )
        {
            debug!("{}: server resolves to {}", self.ctx.ident, name);
        }

        if let Err(e) = self.runtime.writers.write(&Record::Pop3(record)) {
            error!("failed to write POP3 record: {}", e);
        }

        self.extract_mails(&raw_mails, timestamp);
    }

    /// Persist each reconstructed mail body below the file storage root.
    fn extract_mails(&self, raw_mails: &[Vec<u8>], timestamp: i64) {
        let Some(storage) = &self.runtime.config.stream.file_storage else {
            return;
        };

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
            storage_root: storage,
            ident: &self.ctx.ident,
            source: "POP3",
            timestamp,
            packet_context,
        };

        for (i, raw) in raw_mails.iter().enumerate() {
            let name = format!("mail-{}", i);
            match save_file(&ctx, &name, raw, &[]) {
                Ok(Some(record)) => {
                    if let Err(e) =
                        self.runtime.writers.write(&Record::File(record))
                    {
                        error!("failed to write File record: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => error!(
                    "{}: failed to extract mail body: {}",
                    self.ctx.ident, e
                ),
            }
        }
    }

    /// Walk the transcript and reconstruct session state.
    #[allow(clippy::type_complexity)]
    fn parse_transcript(
        &self,
    ) -> (Vec<MailMessage>, String, String, String, Vec<Vec<u8>>) {
        let transcript = self.transcript.lock();
        let requests = &transcript.requests;
        let responses = &transcript.responses;

        let mut mails = Vec::new();
        let mut raw_mails = Vec::new();
        let mut user = String::new();
        let mut pass = String::new();
        let mut token = String::new();

        if requests.is_empty() || responses.is_empty() {
            return (mails, user, pass, token, raw_mails);
        }

        // the server banner must be positive, everything else is noise
        if responses[0].command != "+OK" {
            return (mails, user, pass, token, raw_mails);
        }

        let mut state = Pop3State::NotAuthenticated;
        // index of the last consumed response; 0 is the banner
        let mut res_index: usize = 0;
        let mut req_index: usize = 0;

        let reply_ok = |idx: usize| {
            responses
                .get(idx + 1)
                .map(|r| r.command == "+OK")
                .unwrap_or(false)
        };

        while req_index < requests.len() {
            let request = &requests[req_index];
            req_index += 1;

            match state {
                Pop3State::NotAuthenticated => {
                    match request.command.as_str() {
                        "USER" => {
                            if reply_ok(res_index) {
                                user = request.argument.clone();
                            }
                            res_index += 1;
                        }
                        "PASS" => {
                            if reply_ok(res_index) {
                                state = Pop3State::Authenticated;
                                pass = request.argument.clone();
                            }
                            res_index += 1;
                        }
                        "APOP" => {
                            // APOP <user> <digest>
                            if reply_ok(res_index) {
                                state = Pop3State::Authenticated;
                                let mut parts =
                                    request.argument.split_whitespace();
                                if let Some(name) = parts.next() {
                                    user = name.to_string();
                                }
                                if let Some(digest) = parts.next() {
                                    token = digest.to_string();
                                }
                            }
                            res_index += 1;
                        }
                        "AUTH" => {
                            // the next client line is the opaque token
                            if reply_ok(res_index) {
                                state = Pop3State::Authenticated;
                                if let Some(next) = requests.get(req_index) {
                                    token = join_line(next);
                                }
                            }
                            res_index += 1;
                        }
                        "CAPA" => {
                            res_index = skip_multiline(responses, res_index);
                        }
                        "QUIT" => {
                            state = Pop3State::Closed;
                            break;
                        }
                        _ => res_index += 1,
                    }
                }
                Pop3State::Authenticated => match request.command.as_str() {
                    "STAT" => res_index += 1,
                    "LIST" | "UIDL" | "CAPA" => {
                        res_index = skip_multiline(responses, res_index);
                    }
                    "RETR" | "TOP" => {
                        state = Pop3State::DataTransfer;
                        if reply_ok(res_index) {
                            let (buf, next) =
                                collect_body(responses, res_index + 2);
                            mails.push(parse_mail(&buf));
                            raw_mails.push(buf);
                            res_index = next;
                        } else {
                            res_index += 1;
                        }
                        state = Pop3State::Authenticated;
                    }
                    "QUIT" => {
                        state = Pop3State::Closed;
                        break;
                    }
                    _ => res_index += 1,
                },
                Pop3State::DataTransfer | Pop3State::Closed => break,
            }
        }

        (mails, user, pass, token, raw_mails)
    }
}

/// Cut a line into command and argument.
fn split_command(line: &str) -> (String, String) {
    let trimmed = line.trim_matches(['\r', ' ', '\n']);
    match trimmed.split_once(' ') {
        Some((cmd, args)) => (cmd.to_string(), args.to_string()),
        None => (trimmed.to_string(), String::new()),
    }
}

fn join_line(request: &Pop3Request) -> String {
    if request.argument.is_empty() {
        request.command.clone()
    } else {
        format!("{} {}", request.command, request.argument)
    }
}

/// Server tokens recognized as command lines; anything else from the
/// server is captured as a free-form message line.
fn is_server_token(command: &str) -> bool {
    matches!(
        command,
        "." | "+"
            | "+OK"
            | "-ERR"
            | "TOP"
            | "USER"
            | "UIDL"
            | "STLS"
            | "SASL"
            | "IMPLEMENTATION"
    )
}

/// Advance past a multi-line reply: status line plus lines up to the
/// terminating bare dot. Returns the index of the dot (or the last
/// response if the reply is truncated).
fn skip_multiline(responses: &[Pop3Response], res_index: usize) -> usize {
    let mut idx = res_index + 1;
    while idx < responses.len() {
        if responses[idx].command == "." {
            return idx;
        }
        idx += 1;
    }
    responses.len().saturating_sub(1)
}

/// Collect server lines from `start` until the bare dot into one mail
/// buffer. Returns the buffer and the index of the dot.
fn collect_body(responses: &[Pop3Response], start: usize) -> (Vec<u8>, usize) {
    let mut buf = Vec::new();
    let mut idx = start;
    while idx < responses.len() {
        let response = &responses[idx];
        if response.command == "." {
            return (buf, idx);
        }
        let line = if response.command.is_empty() {
            response.message.clone()
        } else if response.message.is_empty() {
            response.command.clone()
        } else {
            format!("{} {}", response.command, response.message)
        };
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        idx += 1;
    }
    (buf, responses.len().saturating_sub(1))
}
