//! File extraction.
//!
//! When a stream reader reconstructs a transferable blob (a mail body, an
//! HTTP body) it lands here: the content type is sniffed from magic
//! bytes, gzip/deflate transport encodings are removed, the blob is
//! written below `<file_storage>/<content-type>/` with collision
//! avoidance, and a File audit record is emitted.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use tracing::{debug, warn};

use crate::core::md5_hex;
use crate::core::records::{FileRecord, PacketContext};

/// Filenames are truncated to this many characters.
const MAX_NAME_LEN: usize = 250;

/// Stream context needed to name and attribute an extracted file.
pub struct ExtractContext<'a> {
    pub storage_root: &'a Path,
    /// Stream ident, `src:sport-dst:dport`
    pub ident: &'a str,
    /// Producing decoder, e.g. "POP3"
    pub source: &'a str,
    pub timestamp: i64,
    pub packet_context: PacketContext,
}

/// Decompress, sniff, persist and describe one blob. Returns `None` for
/// empty bodies. I/O failures bubble up; the caller logs and continues.
pub fn save_file(
    ctx: &ExtractContext<'_>,
    name: &str,
    body: &[u8],
    content_encoding: &[String],
) -> std::io::Result<Option<FileRecord>> {
    if body.is_empty() {
        return Ok(None);
    }

    let name = if name.is_empty() || name == "/" {
        "unknown"
    } else {
        name
    };

    // remove the transport encoding before sniffing
    let (data, decode_failed) = decode_body(body, content_encoding);
    let ctype = detect_content_type(&data);
    let ext = extension_for(ctype);

    let root = ctx.storage_root.join(ctype);
    std::fs::create_dir_all(&root)?;
    set_dir_permissions(&root);

    let clean = sanitize(name);
    let mut base = format!("{}-{}", clean, sanitize(ctx.ident));
    if decode_failed {
        base = format!("incomplete-{}", base);
    }
    if base.len() > MAX_NAME_LEN {
        base.truncate(MAX_NAME_LEN);
    }

    let target = unique_target(&root, &base, ext);
    std::fs::write(&target, &data)?;
    debug!(
        "{}: saved {} ({} bytes)",
        ctx.ident,
        target.display(),
        data.len()
    );

    let file_name = if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{}{}", name, ext)
    };

    Ok(Some(FileRecord {
        timestamp: ctx.timestamp,
        name: file_name,
        length: data.len() as u64,
        hash: md5_hex(&data),
        location: target.display().to_string(),
        ident: ctx.ident.to_string(),
        source: ctx.source.to_string(),
        content_type: ctype.to_string(),
        context: ctx.packet_context.clone(),
    }))
}

/// Undo a gzip or deflate transport encoding. On decode failure the raw
/// body is kept and the file is marked incomplete.
fn decode_body(body: &[u8], content_encoding: &[String]) -> (Vec<u8>, bool) {
    let encoding = content_encoding
        .first()
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match encoding.as_str() {
        "gzip" => {
            let mut out = Vec::new();
            match GzDecoder::new(body).read_to_end(&mut out) {
                Ok(_) => (out, false),
                Err(e) => {
                    warn!("failed to gzip decode body: {}", e);
                    (body.to_vec(), true)
                }
            }
        }
        "deflate" => {
            // zlib wrapper first, raw deflate as fallback
            let mut out = Vec::new();
            if ZlibDecoder::new(body).read_to_end(&mut out).is_ok() {
                return (out, false);
            }
            out.clear();
            match DeflateDecoder::new(body).read_to_end(&mut out) {
                Ok(_) => (out, false),
                Err(e) => {
                    warn!("failed to deflate decode body: {}", e);
                    (body.to_vec(), true)
                }
            }
        }
        _ => (body.to_vec(), false),
    }
}

/// Magic-byte content sniffing for the types the extractor partitions by.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return "image/png";
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return "image/jpeg";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.starts_with(b"%PDF") {
        return "application/pdf";
    }
    if data.starts_with(&[b'P', b'K', 0x03, 0x04]) {
        return "application/zip";
    }
    if data.starts_with(&[0x1f, 0x8b]) {
        return "application/gzip";
    }
    let head = &data[..data.len().min(512)];
    if looks_like_html(head) {
        return "text/html";
    }
    if head.iter().all(|&b| {
        b == b'\t' || b == b'\n' || b == b'\r' || (0x20..0x7f).contains(&b)
    }) {
        return "text/plain";
    }
    "application/octet-stream"
}

fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head).to_lowercase();
    let trimmed = text.trim_start();
    trimmed.starts_with("<!doctype html") || trimmed.starts_with("<html")
}

fn extension_for(ctype: &str) -> &'static str {
    match ctype {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" => ".gz",
        "text/html" => ".html",
        "text/plain" => ".txt",
        _ => ".bin",
    }
}

/// Keep names path-safe: no separators, no control characters.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches(['-', '.', ' ']);
    if trimmed.is_empty() {
        "noname".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First free path `<root>/<base>[-N]<ext>`.
fn unique_target(root: &Path, base: &str, ext: &str) -> PathBuf {
    let mut target = root.join(format!("{}{}", base, ext));
    let mut n = 0;
    while target.exists() {
        target = root.join(format!("{}-{}{}", base, n, ext));
        n += 1;
    }
    target
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(
        path,
        std::fs::Permissions::from_mode(0o755),
    );
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    fn ctx<'a>(root: &'a Path, context: &'a PacketContext) -> ExtractContext<'a> {
        ExtractContext {
            storage_root: root,
            ident: "10.0.0.1:4000-10.0.0.2:80",
            source: "HTTP",
            timestamp: 1_000,
            packet_context: context.clone(),
        }
    }

    #[test]
    fn test_save_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let context = PacketContext::default();
        let record = save_file(
            &ctx(dir.path(), &context),
            "notes",
            b"hello world\n",
            &[],
        )
        .unwrap()
        .unwrap();

        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.length, 12);
        assert_eq!(record.hash, md5_hex(b"hello world\n"));
        let on_disk = std::fs::read(&record.location).unwrap();
        assert_eq!(on_disk.len() as u64, record.length);
        assert!(record.location.contains("text/plain"));
    }

    #[test]
    fn test_gzip_body_decompressed_and_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let mut png = PNG_MAGIC.to_vec();
        png.extend_from_slice(&[0u8; 2000]);

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&png).unwrap();
        let compressed = enc.finish().unwrap();

        let context = PacketContext::default();
        let record = save_file(
            &ctx(dir.path(), &context),
            "logo",
            &compressed,
            &["gzip".to_string()],
        )
        .unwrap()
        .unwrap();

        assert_eq!(record.content_type, "image/png");
        assert_eq!(record.length, png.len() as u64);
        assert_eq!(record.hash, md5_hex(&png));
        let on_disk = std::fs::read(&record.location).unwrap();
        assert_eq!(on_disk, png);
        assert!(record.location.contains("image/png"));
    }

    #[test]
    fn test_collision_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let context = PacketContext::default();
        let first = save_file(&ctx(dir.path(), &context), "a", b"one", &[])
            .unwrap()
            .unwrap();
        let second = save_file(&ctx(dir.path(), &context), "a", b"two", &[])
            .unwrap()
            .unwrap();
        assert_ne!(first.location, second.location);
        assert!(second.location.contains("-0"));
    }

    #[test]
    fn test_empty_body_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let context = PacketContext::default();
        assert!(save_file(&ctx(dir.path(), &context), "a", b"", &[])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_detect_content_type() {
        assert_eq!(detect_content_type(&PNG_MAGIC), "image/png");
        assert_eq!(detect_content_type(b"%PDF-1.4"), "application/pdf");
        assert_eq!(detect_content_type(b"plain old text"), "text/plain");
        assert_eq!(
            detect_content_type(&[0x00, 0x01, 0x02]),
            "application/octet-stream"
        );
        assert_eq!(
            detect_content_type(b"<!DOCTYPE html><html>"),
            "text/html"
        );
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("../../etc/passwd"), "etc-passwd");
        assert_eq!(sanitize(""), "noname");
        assert_eq!(sanitize("report.pdf"), "report.pdf");
    }
}
