//! End-to-end pipeline scenarios: synthetic captures in, audit record
//! files out.

mod common;

use std::net::Ipv4Addr;
use std::path::Path;

use etherparse::PacketBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use netcap::config::Config;
use netcap::source::open_capture_file;
use netcap::{Collector, RunSummary};

use common::{read_records, write_pcap, TcpSession, CLIENT_MAC, SERVER_MAC};

fn run_capture(pcap: &Path, out: &Path, tweak: impl FnOnce(&mut Config)) -> RunSummary {
    let mut cfg = Config::default();
    cfg.capture.read = Some(pcap.to_path_buf());
    cfg.capture.workers = 1;
    cfg.decode.flow_timeout = 5;
    cfg.decode.conn_timeout = 300;
    cfg.output.out = out.to_path_buf();
    cfg.output.json = true;
    tweak(&mut cfg);

    let collector = Collector::new(cfg).unwrap();
    let source = open_capture_file(pcap).unwrap();
    collector.run(Box::new(source)).unwrap()
}

/// E1: a single ICMP echo pair is one bidirectional connection.
#[test]
fn icmp_echo_pair_is_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let a = Ipv4Addr::new(192, 168, 1, 10);
    let b = Ipv4Addr::new(192, 168, 1, 20);

    let mut frames = Vec::new();
    let request = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
        .ipv4(a.octets(), b.octets(), 64)
        .icmpv4_echo_request(7, 1);
    let mut bytes = Vec::new();
    request.write(&mut bytes, b"ping-payload").unwrap();
    frames.push((100u32, 0u32, bytes));

    let reply = PacketBuilder::ethernet2(SERVER_MAC, CLIENT_MAC)
        .ipv4(b.octets(), a.octets(), 64)
        .icmpv4(etherparse::Icmpv4Type::EchoReply(
            etherparse::IcmpEchoHeader { id: 7, seq: 1 },
        ));
    let mut bytes = Vec::new();
    reply.write(&mut bytes, b"ping-payload").unwrap();
    frames.push((100u32, 500u32, bytes));

    let wire_total: u64 =
        frames.iter().map(|(_, _, d)| d.len() as u64).sum();

    let pcap = dir.path().join("icmp.pcap");
    write_pcap(&pcap, &frames);
    let out = dir.path().join("out");
    let summary = run_capture(&pcap, &out, |_| {});

    assert_eq!(summary.packets, 2);

    let conns = read_records(&out, "Connection.json");
    assert_eq!(conns.len(), 1);
    let conn = &conns[0];
    assert_eq!(conn["num_packets"], 2);
    assert_eq!(conn["total_size"], wire_total);
    assert_eq!(conn["link_proto"], "Ethernet");
    assert_eq!(conn["network_proto"], "IPv4");
    assert_eq!(conn["transport_proto"], "ICMPv4");
    assert_eq!(conn["src_ip"], "192.168.1.10");
    assert!(conn["duration"].as_i64().unwrap() > 0);

    // no stream records for ICMP
    assert!(read_records(&out, "POP3.json").is_empty());
    assert!(read_records(&out, "File.json").is_empty());
}

/// E2: two TCP flows, one of them with a reordered middle, both
/// reassemble completely.
#[test]
fn reordered_flow_reassembles_completely() {
    let dir = tempfile::tempdir().unwrap();
    let client = Ipv4Addr::new(10, 0, 0, 1);
    let server = Ipv4Addr::new(10, 0, 0, 2);

    let mut frames = Vec::new();
    let mut payload_total = 0u64;
    for (flow, port, reorder) in [(0u8, 9001u16, false), (1, 9002, true)] {
        let mut session =
            TcpSession::new((client, 40_000 + flow as u16), (server, port));
        for i in 0..100 {
            let data = format!("xseg{:03}of{}", i, port);
            payload_total += data.len() as u64;
            session.client_send(data.as_bytes());
        }
        let mut flow_frames = session.frames;
        if reorder {
            // shuffle the middle ten segments
            flow_frames[45..55].reverse();
        }
        frames.append(&mut flow_frames);
    }

    let pcap = dir.path().join("two-flows.pcap");
    write_pcap(&pcap, &frames);
    let out = dir.path().join("out");
    let summary = run_capture(&pcap, &out, |cfg| {
        cfg.capture.workers = 2;
    });

    assert_eq!(summary.reassembly.streams_created, 2);
    assert_eq!(summary.reassembly.bytes_delivered, payload_total);

    let conns = read_records(&out, "Connection.json");
    assert_eq!(conns.len(), 2);
    for conn in &conns {
        assert_eq!(conn["num_packets"], 100);
        assert_eq!(conn["transport_proto"], "TCP");
    }
}

fn pop3_session(pass_reply: &str, quit_early: bool) -> TcpSession {
    let mut s = TcpSession::new(
        (Ipv4Addr::new(10, 0, 0, 1), 40_000),
        (Ipv4Addr::new(10, 0, 0, 2), 110),
    );
    s.handshake();
    s.server_send(b"+OK POP server ready\r\n");
    s.client_send(b"USER alice\r\n");
    s.server_send(b"+OK\r\n");
    s.client_send(b"PASS s3cret\r\n");
    s.server_send(format!("{}\r\n", pass_reply).as_bytes());
    if !quit_early {
        s.client_send(b"RETR 1\r\n");
        s.server_send(
            b"+OK\r\n\
              From: bob@example.org\r\n\
              To: alice@example.org\r\n\
              Subject: hi\r\n\
              Envelope-To: a@b\r\n\
              body line one\r\n\
              body line two\r\n\
              .\r\n",
        );
    }
    s.client_send(b"QUIT\r\n");
    s.finish();
    s
}

/// E3: a complete POP3 session yields credentials and one mail.
#[test]
fn pop3_session_reconstructs_mail() {
    let dir = tempfile::tempdir().unwrap();
    let session = pop3_session("+OK", false);

    let pcap = dir.path().join("pop3.pcap");
    write_pcap(&pcap, &session.frames);
    let out = dir.path().join("out");
    run_capture(&pcap, &out, |_| {});

    let records = read_records(&out, "POP3.json");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["user"], "alice");
    assert_eq!(record["pass"], "s3cret");
    assert_eq!(record["client"], "10.0.0.1");
    assert_eq!(record["server"], "10.0.0.2");

    let mails = record["mails"].as_array().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0]["envelope_to"], "a@b");
    assert_eq!(mails[0]["from"], "bob@example.org");
    assert_eq!(mails[0]["body"], "body line one\nbody line two");
}

/// E4: a failed login leaves no credentials and no mail.
#[test]
fn pop3_failed_auth_yields_empty_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = pop3_session("-ERR invalid password", true);

    let pcap = dir.path().join("pop3-err.pcap");
    write_pcap(&pcap, &session.frames);
    let out = dir.path().join("out");
    run_capture(&pcap, &out, |_| {});

    let records = read_records(&out, "POP3.json");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["user"], "alice");
    assert_eq!(record["pass"], "");
    assert!(record["mails"].as_array().unwrap().is_empty());
}

/// E5: a gzip-encoded HTTP body is decompressed, sniffed as PNG and
/// written below the storage root with matching length and hash.
#[test]
fn http_gzip_body_extracted_as_png() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("files");

    let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    png.extend(std::iter::repeat(0xabu8).take(2040));

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&png).unwrap();
    let gz = enc.finish().unwrap();

    let mut session = TcpSession::new(
        (Ipv4Addr::new(10, 0, 0, 1), 50_000),
        (Ipv4Addr::new(10, 0, 0, 3), 80),
    );
    session.handshake();
    session.client_send(b"GET /logo HTTP/1.1\r\nHost: example.org\r\n\r\n");
    session.server_send(
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: image/png\r\n\
             Content-Encoding: gzip\r\n\
             Content-Length: {}\r\n\r\n",
            gz.len()
        )
        .as_bytes(),
    );
    for chunk in gz.chunks(1200) {
        session.server_send(chunk);
    }
    session.finish();

    let pcap = dir.path().join("http.pcap");
    write_pcap(&pcap, &session.frames);
    let out = dir.path().join("out");
    run_capture(&pcap, &out, |cfg| {
        cfg.stream.file_storage = Some(storage.clone());
    });

    let records = read_records(&out, "File.json");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record["content_type"], "image/png");
    assert_eq!(record["length"], png.len() as u64);
    assert_eq!(record["source"], "HTTP");
    assert_eq!(record["name"], "logo.png");

    let location = record["location"].as_str().unwrap();
    assert!(location.contains("image/png"));
    let on_disk = std::fs::read(location).unwrap();
    assert_eq!(on_disk, png);
    assert_eq!(
        record["hash"].as_str().unwrap(),
        format!("{:x}", md5::compute(&png))
    );
}

/// E6: a packet without any transport layer still yields a connection
/// record with empty transport fields.
#[test]
fn packet_without_transport_layer() {
    let dir = tempfile::tempdir().unwrap();
    let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC).ipv4(
        [172, 16, 0, 1],
        [172, 16, 0, 2],
        64,
    );
    let mut bytes = Vec::new();
    builder
        .write(&mut bytes, etherparse::IpNumber(253), &[])
        .unwrap();

    let pcap = dir.path().join("raw.pcap");
    write_pcap(&pcap, &[(100, 0, bytes)]);
    let out = dir.path().join("out");
    let summary = run_capture(&pcap, &out, |_| {});

    assert_eq!(summary.packets, 1);
    let conns = read_records(&out, "Connection.json");
    assert_eq!(conns.len(), 1);
    let conn = &conns[0];
    assert_eq!(conn["num_packets"], 1);
    assert_eq!(conn["transport_proto"], "");
    assert_eq!(conn["application_proto"], "");
    assert_eq!(conn["src_port"], "");
    assert_eq!(conn["network_proto"], "IPv4");
}

/// A segment with a corrupted TCP checksum is refused by the
/// reassembler when verification is on, while the trackers still count
/// the packet.
#[test]
fn bad_checksum_segment_not_reassembled() {
    let build_frames = || {
        let mut session = TcpSession::new(
            (Ipv4Addr::new(10, 2, 0, 1), 43_000),
            (Ipv4Addr::new(10, 2, 0, 2), 9011),
        );
        session.client_send(b"xcorrupted data");
        let mut frames = session.frames;
        // flip the last payload byte so the checksum no longer matches
        let end = frames[0].2.len() - 1;
        frames[0].2[end] ^= 0xff;
        frames
    };

    // verification on: the segment never reaches the byte streams
    let dir = tempfile::tempdir().unwrap();
    let pcap = dir.path().join("bad-checksum.pcap");
    write_pcap(&pcap, &build_frames());
    let out = dir.path().join("out");
    let summary = run_capture(&pcap, &out, |cfg| {
        cfg.stream.checksum = true;
    });

    assert_eq!(summary.reassembly.segments, 1);
    assert_eq!(summary.reassembly.checksum_errors, 1);
    assert_eq!(summary.reassembly.bytes_delivered, 0);
    assert_eq!(summary.reassembly.streams_created, 0);

    let conns = read_records(&out, "Connection.json");
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0]["num_packets"], 1);

    // verification off: the same capture reassembles as usual
    let dir = tempfile::tempdir().unwrap();
    let pcap = dir.path().join("bad-checksum.pcap");
    write_pcap(&pcap, &build_frames());
    let out = dir.path().join("out");
    let summary = run_capture(&pcap, &out, |_| {});

    assert_eq!(summary.reassembly.checksum_errors, 0);
    assert_eq!(summary.reassembly.bytes_delivered, 15);
}

/// Swapping two packets of one flow produces identical connection
/// records thanks to the first-seen rewrite rule.
#[test]
fn packet_reordering_is_invisible_in_records() {
    let run = |swap: bool| -> serde_json::Value {
        let dir = tempfile::tempdir().unwrap();
        let mut session = TcpSession::new(
            (Ipv4Addr::new(10, 9, 0, 1), 41_000),
            (Ipv4Addr::new(10, 9, 0, 2), 9005),
        );
        session.client_send(b"xfirst");
        session.server_send(b"xsecond");
        let mut frames = session.frames;
        if swap {
            frames.swap(0, 1);
        }

        let pcap = dir.path().join("swap.pcap");
        write_pcap(&pcap, &frames);
        let out = dir.path().join("out");
        run_capture(&pcap, &out, |_| {});

        let mut conns = read_records(&out, "Connection.json");
        assert_eq!(conns.len(), 1);
        conns.remove(0)
    };

    let baseline = run(false);
    let swapped = run(true);
    assert_eq!(baseline, swapped);
}

/// A run producing zero records of a type leaves no file of that type.
#[test]
fn empty_outputs_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = TcpSession::new(
        (Ipv4Addr::new(10, 1, 0, 1), 42_000),
        (Ipv4Addr::new(10, 1, 0, 2), 9009),
    );
    session.client_send(b"xnothing to see");
    let pcap = dir.path().join("plain.pcap");
    write_pcap(&pcap, &session.frames);
    let out = dir.path().join("out");
    run_capture(&pcap, &out, |_| {});

    assert!(out.join("Connection.json").exists());
    assert!(out.join("Flow.json").exists());
    assert!(!out.join("POP3.json").exists());
    assert!(!out.join("File.json").exists());
}
