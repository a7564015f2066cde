//! Per-connection request loop: HTTP/1.1 keep-alive, inbound limits,
//! body framing (including streaming multipart), dispatch, and
//! response serialization. One connection is handled to completion on
//! one worker thread.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::app::Engine;
use crate::config::Config;
use crate::error::Error;
use crate::http::{Body, Method, Request, Response, status_reason};
use crate::metrics::ServerMetrics;
use crate::multipart::{boundary_from_content_type, MultipartStream, UploadFile};
use crate::parser::{self, ParseError};
use crate::perf;
use crate::stream;

const READ_CHUNK: usize = 8 * 1024;

enum HeadOutcome {
    /// A complete head plus the bytes it consumed.
    Head(Request, usize),
    /// EOF or idle timeout with no request in progress.
    Idle,
    /// A fatal condition that maps to a response (then close).
    Fail(Error),
    /// Transport error; nothing more to say to the peer.
    Broken,
}

pub(crate) fn handle_connection(mut stream: TcpStream, engine: &Engine, shutdown: &AtomicBool) {
    let config = engine.config().clone();
    let metrics = engine.context().metrics.clone();
    let _ = stream.set_nodelay(true);

    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut served: u32 = 0;

    loop {
        let (mut request, consumed) = match read_head(&mut stream, &mut buf, &config, served) {
            HeadOutcome::Head(request, consumed) => (request, consumed),
            HeadOutcome::Idle => break,
            HeadOutcome::Fail(err) => {
                let _ = write_response(&mut stream, err.into_response(), false, false, &metrics, &config);
                break;
            }
            HeadOutcome::Broken => break,
        };
        buf.drain(..consumed);
        served += 1;
        metrics.inc_req();

        let is_head = request.method == Method::Head;
        let mut uploads: Vec<UploadFile> = Vec::new();
        let mut early: Option<Response> = None;
        let mut force_close = false;

        match read_body(&mut stream, &mut buf, &mut request, &mut uploads, engine, &config) {
            Ok(()) => {}
            Err(err) => {
                // The socket position is unknown after a framing error.
                early = Some(err.into_response());
                force_close = true;
            }
        }

        let keep_alive = !force_close
            && request.keep_alive_requested()
            && served < config.max_requests_per_connection
            && !shutdown.load(Ordering::Acquire);

        let response = match early {
            Some(response) => response,
            None => engine.dispatch(request, uploads),
        };
        let handler_wants_close = response
            .headers
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"));
        let keep_alive = keep_alive && !handler_wants_close;

        if write_response(&mut stream, response, is_head, keep_alive, &metrics, &config).is_err() {
            break;
        }
        if !keep_alive {
            break;
        }
    }
    debug!(served, "connection closed");
}

/// Accumulate bytes until a full head parses, honoring the idle
/// (keep-alive) and read timeouts and the header size limit.
fn read_head(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    config: &Config,
    served: u32,
) -> HeadOutcome {
    loop {
        match parser::parse_head(buf, config.max_header_bytes) {
            Ok(Some((head, consumed))) => {
                let mut request = Request::new(head.method, head.path);
                request.raw_query = head.query.map(str::to_string);
                for (name, value) in head.headers {
                    request.headers.append(name, value);
                }
                return HeadOutcome::Head(request, consumed);
            }
            Ok(None) => {}
            Err(ParseError::TooLarge) => return HeadOutcome::Fail(Error::HeadersTooLarge),
            Err(ParseError::Malformed(reason)) => {
                return HeadOutcome::Fail(Error::BadRequest(reason.to_string()))
            }
        }

        // Between requests an idle socket gets the keep-alive budget;
        // once bytes arrive the stricter read timeout applies.
        let timeout = if buf.is_empty() && served > 0 {
            config.keepalive_timeout
        } else {
            config.read_timeout
        };
        if stream.set_read_timeout(Some(timeout)).is_err() {
            return HeadOutcome::Broken;
        }

        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => {
                return if buf.is_empty() {
                    HeadOutcome::Idle
                } else {
                    HeadOutcome::Fail(Error::BadRequest("connection closed mid-request".into()))
                };
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                return if buf.is_empty() {
                    HeadOutcome::Idle
                } else {
                    // 408 Request Timeout: the head never completed.
                    HeadOutcome::Fail(Error::RequestTimeout("request head incomplete".into()))
                };
            }
            Err(_) => return HeadOutcome::Broken,
        }
    }
}

/// Frame and read the request body. Multipart bodies stream through
/// the upload parser with bounded memory; everything else is buffered
/// whole (it already passed the size limit).
fn read_body(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    request: &mut Request,
    uploads: &mut Vec<UploadFile>,
    engine: &Engine,
    config: &Config,
) -> crate::error::Result<()> {
    if request
        .headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Err(Error::BadRequest(
            "chunked request bodies are not supported".into(),
        ));
    }

    let content_length = match request.headers.get("content-length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::BadRequest("invalid content-length".into()))?,
        None => 0,
    };
    if content_length == 0 {
        return Ok(());
    }
    if content_length > config.max_body_bytes {
        return Err(Error::PayloadTooLarge(format!(
            "body of {} bytes exceeds the limit",
            content_length
        )));
    }

    stream
        .set_read_timeout(Some(config.read_timeout))
        .map_err(Error::Io)?;

    let is_multipart = request.content_type() == Some("multipart/form-data");
    if is_multipart {
        let boundary = request
            .headers
            .get("content-type")
            .and_then(boundary_from_content_type)
            .ok_or_else(|| Error::BadRequest("multipart body without a boundary".into()))?;

        let buffered = buf.len().min(content_length);
        let prefix: Vec<u8> = buf.drain(..buffered).collect();
        let remaining = (content_length - buffered) as u64;
        let reader = io::Cursor::new(prefix).chain((&*stream).take(remaining));

        let mut parts = MultipartStream::new(reader, &boundary, engine.upload_policy());
        while let Some(part) = parts.next_part().map_err(map_read_timeout)? {
            uploads.push(part);
        }
        // Consume the epilogue so the next request starts cleanly.
        let mut rest = parts.into_inner();
        io::copy(&mut rest, &mut io::sink()).map_err(|e| map_read_timeout(Error::Io(e)))?;
        return Ok(());
    }

    let mut body = Vec::with_capacity(content_length);
    let buffered = buf.len().min(content_length);
    body.extend_from_slice(&buf[..buffered]);
    buf.drain(..buffered);

    if body.len() < content_length {
        let mut rest = vec![0u8; content_length - body.len()];
        stream
            .read_exact(&mut rest)
            .map_err(|e| map_read_timeout(Error::Io(e)))?;
        body.extend_from_slice(&rest);
    }
    request.body = Bytes::from(body);
    Ok(())
}

/// Socket timeouts while reading a body surface as 408, not 500.
fn map_read_timeout(err: Error) -> Error {
    match err {
        Error::Io(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
        {
            Error::RequestTimeout("request body read timed out".into())
        }
        other => other,
    }
}

/// Serialize a response. HEAD requests get the full header set
/// (including `Content-Length`) with the body suppressed; streamed
/// bodies go out chunked with per-chunk flushes.
pub(crate) fn write_response(
    stream: &mut TcpStream,
    mut resp: Response,
    is_head: bool,
    keep_alive: bool,
    metrics: &ServerMetrics,
    config: &Config,
) -> io::Result<()> {
    stream.set_write_timeout(Some(config.write_timeout))?;

    if !resp.headers.contains("date") {
        resp.headers.insert("date", perf::cached_date_header());
    }
    if !resp.headers.contains("server") {
        resp.headers.insert("server", "felis");
    }
    resp.headers
        .insert("connection", if keep_alive { "keep-alive" } else { "close" });

    if resp.body.is_stream() {
        resp.headers.remove("content-length");
        resp.headers.insert("transfer-encoding", "chunked");
        if !resp.trailers.is_empty() {
            let names: Vec<&str> = resp.trailers.iter().map(|(k, _)| k.as_str()).collect();
            resp.headers.insert("trailer", names.join(", "));
        }
    } else if resp.status != 204 && resp.status != 304 {
        resp.headers
            .insert("content-length", resp.body.len().to_string());
    }

    let Response {
        status,
        headers,
        body,
        trailers,
    } = resp;

    let mut head = Vec::with_capacity(256);
    write!(head, "HTTP/1.1 {} {}\r\n", status, status_reason(status))?;
    for (name, value) in headers.iter() {
        write!(head, "{}: {}\r\n", name, value)?;
    }
    head.extend_from_slice(b"\r\n");
    stream.write_all(&head)?;
    metrics.add_bytes(head.len());

    match body {
        Body::Stream(producer) if !is_head => {
            let written = stream::write_chunked(stream, producer, &trailers).map_err(|e| {
                match e {
                    Error::Io(io_err) => io_err,
                    other => io::Error::other(other.to_string()),
                }
            })?;
            metrics.add_bytes(written as usize);
        }
        Body::Bytes(bytes) if !is_head && !bytes.is_empty() => {
            stream.write_all(&bytes)?;
            metrics.add_bytes(bytes.len());
        }
        _ => {}
    }

    if let Err(e) = stream.flush() {
        warn!(error = %e, "response flush failed");
        return Err(e);
    }
    Ok(())
}
