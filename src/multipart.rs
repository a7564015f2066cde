//! Incremental `multipart/form-data` parsing (RFC 7578) with bounded
//! memory: part bodies above the buffering threshold spool to a temp
//! file that is unlinked when the part is dropped.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::UploadConfig;
use crate::error::{Error, Result};

const FILL_CHUNK: usize = 8 * 1024;
const MAX_PART_HEADER_BYTES: usize = 8 * 1024;

/// Extract the boundary token from a `Content-Type` header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    if !parts
        .next()?
        .trim()
        .eq_ignore_ascii_case("multipart/form-data")
    {
        return None;
    }
    for param in parts {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Per-field constraints applied as parts arrive.
#[derive(Debug, Clone, Default)]
pub struct FieldRules {
    /// Accepted MIME types; `None` accepts anything.
    pub allowed_types: Option<Vec<String>>,
    /// Per-part size cap in bytes.
    pub max_size: Option<u64>,
    /// Verify the declared content type against magic bytes.
    pub check_signature: bool,
    /// Run the configured scanner command over this field's parts.
    pub virus_scan: bool,
}

/// Upload policy for one request: spooling parameters plus optional
/// per-field rules.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_buffered_bytes: usize,
    pub spool_dir: PathBuf,
    pub virus_scan_cmd: Option<String>,
    pub fields: HashMap<String, FieldRules>,
}

impl UploadPolicy {
    pub fn from_config(config: &UploadConfig) -> Self {
        UploadPolicy {
            max_buffered_bytes: config.max_buffered_bytes,
            spool_dir: config.spool_dir.clone(),
            virus_scan_cmd: config.virus_scan_cmd.clone(),
            fields: HashMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, rules: FieldRules) -> Self {
        self.fields.insert(name.into(), rules);
        self
    }
}

/// Where a finished part lives.
pub enum UploadBacking {
    Memory(Bytes),
    /// Spooled file; unlinked on drop.
    Spooled(NamedTempFile),
}

/// One multipart field, buffered or spooled. Every field surfaces as
/// an `UploadFile` regardless of backing.
pub struct UploadFile {
    pub field_name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: u64,
    backing: UploadBacking,
}

impl UploadFile {
    pub fn is_spooled(&self) -> bool {
        matches!(self.backing, UploadBacking::Spooled(_))
    }

    /// The spool path, when the part was spooled.
    pub fn spool_path(&self) -> Option<&Path> {
        match &self.backing {
            UploadBacking::Spooled(file) => Some(file.path()),
            UploadBacking::Memory(_) => None,
        }
    }

    /// Full part contents. Spooled parts are read back from disk.
    pub fn bytes(&self) -> Result<Bytes> {
        match &self.backing {
            UploadBacking::Memory(data) => Ok(data.clone()),
            UploadBacking::Spooled(file) => Ok(Bytes::from(std::fs::read(file.path())?)),
        }
    }

    /// Copy the part to `dest`, whatever the backing.
    pub fn copy_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        match &self.backing {
            UploadBacking::Memory(data) => std::fs::write(dest, data)?,
            UploadBacking::Spooled(file) => {
                std::fs::copy(file.path(), dest)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("field_name", &self.field_name)
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.size)
            .field("spooled", &self.is_spooled())
            .finish()
    }
}

/// Pull parser: yields parts in document order (repeated field names
/// keep their order). Drives the underlying reader incrementally; at
/// most `max_buffered_bytes` of one part body is resident plus the
/// sliding search window.
pub struct MultipartStream<'p, R: Read> {
    reader: R,
    policy: &'p UploadPolicy,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    eof: bool,
    started: bool,
    done: bool,
}

impl<'p, R: Read> MultipartStream<'p, R> {
    pub fn new(reader: R, boundary: &str, policy: &'p UploadPolicy) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        MultipartStream {
            reader,
            policy,
            delimiter,
            buf: Vec::new(),
            eof: false,
            started: false,
            done: false,
        }
    }

    /// Parse every part eagerly.
    pub fn collect_parts(mut self) -> Result<Vec<UploadFile>> {
        let mut parts = Vec::new();
        while let Some(part) = self.next_part()? {
            parts.push(part);
        }
        Ok(parts)
    }

    /// Hand back the underlying reader, e.g. to drain the epilogue.
    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn next_part(&mut self) -> Result<Option<UploadFile>> {
        if self.done {
            return Ok(None);
        }
        if !self.started {
            self.seek_first_delimiter()?;
            self.started = true;
        }

        // After a delimiter: "--" closes the stream, CRLF opens a part.
        self.want(2)?;
        if self.buf.starts_with(b"--") {
            self.done = true;
            return Ok(None);
        }
        if self.buf.starts_with(b"\r\n") {
            self.buf.drain(..2);
        }

        let (field_name, filename, content_type) = self.read_part_headers()?;
        let rules = self
            .policy
            .fields
            .get(&field_name)
            .cloned()
            .unwrap_or_default();

        if let (Some(allowed), Some(declared)) = (&rules.allowed_types, &content_type) {
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(declared)) {
                return Err(Error::BadRequest(format!(
                    "field '{}' does not accept content type '{}'",
                    field_name, declared
                )));
            }
        }

        let mut sink = PartSink::new(
            self.policy.max_buffered_bytes,
            &self.policy.spool_dir,
            rules.max_size,
            &field_name,
        );
        self.read_part_body(&mut sink)?;
        let (backing, size, head) = sink.finish()?;

        if rules.check_signature {
            if let Some(declared) = &content_type {
                check_signature(&field_name, declared, &head)?;
            }
        }

        let file = UploadFile {
            field_name,
            filename,
            content_type,
            size,
            backing,
        };

        if rules.virus_scan {
            if let Some(cmd) = &self.policy.virus_scan_cmd {
                scan_part(cmd, &file, &self.policy.spool_dir)?;
            }
        }

        debug!(field = %file.field_name, size = file.size, spooled = file.is_spooled(), "multipart part parsed");
        Ok(Some(file))
    }

    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; FILL_CHUNK];
        let n = self.reader.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Ensure at least `n` bytes are buffered.
    fn want(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            if self.eof {
                return Err(Error::BadRequest("truncated multipart body".into()));
            }
            self.fill()?;
        }
        Ok(())
    }

    fn seek_first_delimiter(&mut self) -> Result<()> {
        loop {
            if let Some(i) = find(&self.buf, &self.delimiter) {
                self.buf.drain(..i + self.delimiter.len());
                return Ok(());
            }
            // Keep a window for a delimiter split across reads.
            let keep = self.delimiter.len().saturating_sub(1).min(self.buf.len());
            self.buf.drain(..self.buf.len() - keep);
            if self.eof {
                return Err(Error::BadRequest("multipart boundary not found".into()));
            }
            self.fill()?;
        }
    }

    fn read_part_headers(&mut self) -> Result<(String, Option<String>, Option<String>)> {
        let header_end = loop {
            if let Some(i) = find(&self.buf, b"\r\n\r\n") {
                break i;
            }
            if self.buf.len() > MAX_PART_HEADER_BYTES {
                return Err(Error::BadRequest("multipart part headers too large".into()));
            }
            if self.eof {
                return Err(Error::BadRequest("truncated multipart headers".into()));
            }
            self.fill()?;
        };

        let header_block = String::from_utf8(self.buf[..header_end].to_vec())
            .map_err(|_| Error::BadRequest("multipart headers are not UTF-8".into()))?;
        self.buf.drain(..header_end + 4);

        let mut field_name = None;
        let mut filename = None;
        let mut content_type = None;

        for line in header_block.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-disposition") {
                field_name = disposition_param(value, "name");
                filename = disposition_param(value, "filename");
            } else if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }

        let field_name = field_name
            .ok_or_else(|| Error::BadRequest("multipart part without a field name".into()))?;
        Ok((field_name, filename, content_type))
    }

    fn read_part_body(&mut self, sink: &mut PartSink<'_>) -> Result<()> {
        // The closing delimiter is preceded by CRLF.
        let mut needle = Vec::with_capacity(self.delimiter.len() + 2);
        needle.extend_from_slice(b"\r\n");
        needle.extend_from_slice(&self.delimiter);

        loop {
            if let Some(i) = find(&self.buf, &needle) {
                sink.write(&self.buf[..i])?;
                self.buf.drain(..i + needle.len());
                return Ok(());
            }
            let keep = needle.len().saturating_sub(1).min(self.buf.len());
            let flush = self.buf.len() - keep;
            if flush > 0 {
                sink.write(&self.buf[..flush])?;
                self.buf.drain(..flush);
            }
            if self.eof {
                return Err(Error::BadRequest("truncated multipart part".into()));
            }
            self.fill()?;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Pull `name="value"` out of a Content-Disposition header.
fn disposition_param(header: &str, name: &str) -> Option<String> {
    for param in header.split(';') {
        let (key, value) = match param.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

const HEAD_LEN: usize = 16;

enum SinkBacking {
    Memory(Vec<u8>),
    Spooled(NamedTempFile),
}

struct PartSink<'a> {
    backing: SinkBacking,
    spool_threshold: usize,
    spool_dir: &'a Path,
    max_size: Option<u64>,
    field_name: &'a str,
    size: u64,
    head: [u8; HEAD_LEN],
    head_len: usize,
}

impl<'a> PartSink<'a> {
    fn new(
        spool_threshold: usize,
        spool_dir: &'a Path,
        max_size: Option<u64>,
        field_name: &'a str,
    ) -> Self {
        PartSink {
            backing: SinkBacking::Memory(Vec::new()),
            spool_threshold,
            spool_dir,
            max_size,
            field_name,
            size: 0,
            head: [0u8; HEAD_LEN],
            head_len: 0,
        }
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.size += chunk.len() as u64;
        if let Some(max) = self.max_size {
            if self.size > max {
                return Err(Error::PayloadTooLarge(format!(
                    "field '{}' exceeds its {} byte limit",
                    self.field_name, max
                )));
            }
        }

        if self.head_len < HEAD_LEN {
            let take = (HEAD_LEN - self.head_len).min(chunk.len());
            self.head[self.head_len..self.head_len + take].copy_from_slice(&chunk[..take]);
            self.head_len += take;
        }

        match &mut self.backing {
            SinkBacking::Memory(data) if data.len() + chunk.len() > self.spool_threshold => {
                debug!(field = %self.field_name, "spooling oversized multipart part");
                let mut file = NamedTempFile::new_in(self.spool_dir)?;
                file.write_all(data)?;
                file.write_all(chunk)?;
                self.backing = SinkBacking::Spooled(file);
            }
            SinkBacking::Memory(data) => data.extend_from_slice(chunk),
            SinkBacking::Spooled(file) => {
                file.write_all(chunk)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<(UploadBacking, u64, Vec<u8>)> {
        let head = self.head[..self.head_len].to_vec();
        let backing = match self.backing {
            SinkBacking::Memory(data) => UploadBacking::Memory(Bytes::from(data)),
            SinkBacking::Spooled(mut file) => {
                file.flush()?;
                UploadBacking::Spooled(file)
            }
        };
        Ok((backing, self.size, head))
    }
}

/// Magic-byte signatures for the declared-vs-actual content check.
const SIGNATURES: &[(&str, &[u8])] = &[
    ("image/jpeg", &[0xFF, 0xD8, 0xFF]),
    ("image/png", &[0x89, b'P', b'N', b'G']),
    ("image/gif", b"GIF8"),
    ("application/pdf", b"%PDF"),
    ("application/zip", &[b'P', b'K', 0x03, 0x04]),
];

fn check_signature(field: &str, declared: &str, head: &[u8]) -> Result<()> {
    let declared = declared
        .split(';')
        .next()
        .unwrap_or(declared)
        .trim()
        .to_ascii_lowercase();
    for (mime, magic) in SIGNATURES {
        if *mime == declared {
            if head.starts_with(magic) {
                return Ok(());
            }
            return Err(Error::BadRequest(format!(
                "field '{}' content does not match declared type '{}'",
                field, declared
            )));
        }
    }
    // No signature on file for this type; nothing to verify.
    Ok(())
}

/// Run the configured scanner over the part. The command receives the
/// part's path as its final argument; a non-zero exit rejects it.
fn scan_part(cmd: &str, file: &UploadFile, spool_dir: &Path) -> Result<()> {
    let mut argv = cmd.split_whitespace();
    let program = argv
        .next()
        .ok_or_else(|| Error::Internal("empty virus_scan_cmd".into()))?;

    // In-memory parts are materialized so the scanner sees a file.
    let temp_holder;
    let path: &Path = match file.spool_path() {
        Some(path) => path,
        None => {
            let mut tmp = NamedTempFile::new_in(spool_dir)?;
            tmp.write_all(&file.bytes()?)?;
            tmp.flush()?;
            temp_holder = tmp;
            temp_holder.path()
        }
    };

    let status = Command::new(program)
        .args(argv)
        .arg(path)
        .status()
        .map_err(|e| Error::Internal(format!("virus scanner failed to start: {}", e)))?;

    if status.success() {
        Ok(())
    } else {
        Err(Error::BadRequest(format!(
            "field '{}' rejected by virus scanner",
            file.field_name
        )))
    }
}
