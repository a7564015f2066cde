//! HTTP/1.1 request-head parsing over a growing connection buffer.
//! Borrow-based: the head points into the caller's buffer; the
//! connection loop copies what it keeps and drains what it consumed.

use crate::http::Method;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Syntactically invalid; the connection answers 400 and closes.
    Malformed(&'static str),
    /// Header block over the configured limit; 431.
    TooLarge,
}

#[derive(Debug)]
pub struct RequestHead<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: Vec<(&'a str, &'a str)>,
}

/// Try to parse one request head out of `buf`.
///
/// `Ok(None)` means more bytes are needed. `Ok(Some((head, n)))`
/// consumed `n` bytes (request line + headers + blank line); the body,
/// if any, starts at `buf[n..]`.
pub fn parse_head(
    buf: &[u8],
    max_header_bytes: usize,
) -> Result<Option<(RequestHead<'_>, usize)>, ParseError> {
    let head_end = match find_head_end(buf) {
        Some(end) => end,
        None => {
            if buf.len() > max_header_bytes {
                return Err(ParseError::TooLarge);
            }
            return Ok(None);
        }
    };
    if head_end > max_header_bytes {
        return Err(ParseError::TooLarge);
    }

    let head = &buf[..head_end];
    let mut lines = split_crlf(head);

    let request_line = lines
        .next()
        .ok_or(ParseError::Malformed("empty request"))?;
    let request_line = std::str::from_utf8(request_line)
        .map_err(|_| ParseError::Malformed("request line is not UTF-8"))?;

    let mut parts = request_line.split(' ');
    let method_text = parts
        .next()
        .ok_or(ParseError::Malformed("missing method"))?;
    let target = parts.next().ok_or(ParseError::Malformed("missing path"))?;
    let version = parts
        .next()
        .ok_or(ParseError::Malformed("missing HTTP version"))?;
    if parts.next().is_some() {
        return Err(ParseError::Malformed("malformed request line"));
    }
    if !version.starts_with("HTTP/1.") {
        return Err(ParseError::Malformed("unsupported HTTP version"));
    }
    if method_text.is_empty() || target.is_empty() {
        return Err(ParseError::Malformed("malformed request line"));
    }

    let method = Method::from_bytes(method_text.as_bytes());
    let (path, query) = match target.find('?') {
        Some(i) => (&target[..i], Some(&target[i + 1..])),
        None => (target, None),
    };
    if path != "*" && !path.starts_with('/') {
        return Err(ParseError::Malformed("request target must be absolute"));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let line =
            std::str::from_utf8(line).map_err(|_| ParseError::Malformed("header is not UTF-8"))?;
        let (name, value) = line
            .split_once(':')
            .ok_or(ParseError::Malformed("header without a colon"))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(ParseError::Malformed("invalid header name"));
        }
        headers.push((name, value.trim()));
    }

    Ok(Some((
        RequestHead {
            method,
            path,
            query,
            headers,
        },
        head_end + 4,
    )))
}

/// Offset of the `\r\n\r\n` terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_crlf(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
