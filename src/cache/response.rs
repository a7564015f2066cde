//! Response caching as a middleware: a rule table maps request paths
//! to TTLs; hits short-circuit the chain, concurrent misses are
//! single-flighted through [`TieredCache::get_or_build`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::http::{Body, HeaderMap, Method, Request, RequestContext, Response};
use crate::middleware::{Middleware, Next};

/// One caching rule: a path pattern (single-segment `*`, multi-segment
/// `**`), the TTL for stored responses, and which methods/statuses are
/// cacheable.
#[derive(Debug, Clone)]
pub struct CacheRule {
    pub pattern: String,
    pub ttl: Duration,
    pub methods: Vec<Method>,
    pub statuses: Vec<u16>,
}

impl CacheRule {
    pub fn new(pattern: impl Into<String>, ttl: Duration) -> Self {
        CacheRule {
            pattern: pattern.into(),
            ttl,
            methods: vec![Method::Get],
            statuses: vec![200],
        }
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = methods.to_vec();
        self
    }

    pub fn statuses(mut self, statuses: &[u16]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }
}

/// Priority-ordered response cache middleware. First matching rule
/// wins; requests without a matching rule pass through untouched.
pub struct ResponseCache {
    rules: Vec<CacheRule>,
    selected_headers: Vec<String>,
    build_timeout: Duration,
}

impl ResponseCache {
    pub fn new(rules: Vec<CacheRule>) -> Self {
        ResponseCache {
            rules,
            selected_headers: Vec::new(),
            build_timeout: Duration::from_secs(10),
        }
    }

    /// Headers folded into the fingerprint (e.g. `accept-encoding`).
    pub fn selected_headers(mut self, headers: &[&str]) -> Self {
        self.selected_headers = headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        self
    }

    /// How long a single-flight builder may run before a waiter is
    /// promoted in its place.
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    fn matching_rule(&self, method: Method, normalized_path: &str) -> Option<&CacheRule> {
        self.rules
            .iter()
            .find(|r| r.methods.contains(&method) && glob_match(&r.pattern, normalized_path))
    }
}

impl Middleware for ResponseCache {
    fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Response> {
        let method = ctx.request.method;
        let normalized = normalize_path(&ctx.request.path);

        let rule = match self.matching_rule(method, &normalized) {
            Some(rule) => rule,
            None => return next.run(ctx),
        };

        let key = fingerprint(method, &normalized, &ctx.request, &self.selected_headers);
        let ttl = rule.ttl;
        let statuses = rule.statuses.clone();
        let expires_at = unix_now() + ttl.as_secs();

        let app = ctx.app.clone();
        let mut next_slot = Some(next);
        let mut passthrough: Option<Response> = None;

        let outcome = app.cache.get_or_build(&key, Some(ttl), self.build_timeout, || {
            let next = next_slot
                .take()
                .ok_or_else(|| Error::Internal("cache build ran twice".into()))?;
            // Errors become their mapped responses here so concurrent
            // waiters observe the real status, not an opaque failure.
            let resp = match next.run(&mut *ctx) {
                Ok(resp) => resp,
                Err(err) => err.into_response(),
            };
            if resp.body.is_stream() {
                // Streams cannot be replayed; hand the response through
                // and leave a marker for concurrent waiters.
                passthrough = Some(resp);
                return Ok((Bytes::from_static(&[MARKER_UNCACHEABLE]), false));
            }
            let store = statuses.contains(&resp.status);
            Ok((encode_response(&resp, expires_at), store))
        })?;

        if let Some(resp) = passthrough {
            return Ok(resp);
        }

        let cached = outcome.was_cached();
        match decode_response(&outcome.into_bytes()) {
            Some(resp) => Ok(resp.header("x-cache", if cached { "HIT" } else { "MISS" })),
            None => match next_slot.take() {
                // Marker or stale entry: this caller runs its own chain.
                Some(next) => next.run(ctx),
                None => Err(Error::Internal("uncacheable response lost".into())),
            },
        }
    }
}

/// Lowercase the path and strip a trailing slash (except root).
pub fn normalize_path(path: &str) -> String {
    let mut normalized = path.to_ascii_lowercase();
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Stable request fingerprint:
/// `hash(method \0 normalized_path \0 sorted_query \0 selected_headers)`.
/// Query pairs are sorted so parameter order never changes the key.
pub fn fingerprint(
    method: Method,
    normalized_path: &str,
    request: &Request,
    selected_headers: &[String],
) -> String {
    let mut pairs = request.query_pairs();
    pairs.sort();
    let sorted_query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(sorted_query.as_bytes());
    hasher.update([0u8]);
    for name in selected_headers {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(request.header(name).unwrap_or("").as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

/// Segment glob: `*` matches exactly one segment, `**` any remainder.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    fn split(s: &str) -> Vec<&str> {
        s.split('/').filter(|s| !s.is_empty()).collect()
    }
    fn matches(pattern: &[&str], path: &[&str]) -> bool {
        match (pattern.first(), path.first()) {
            (None, None) => true,
            (Some(&"**"), _) => {
                matches(&pattern[1..], path)
                    || (!path.is_empty() && matches(pattern, &path[1..]))
            }
            (None, Some(_)) | (Some(_), None) => false,
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &path[1..]),
            (Some(&literal), Some(&segment)) => {
                literal == segment && matches(&pattern[1..], &path[1..])
            }
        }
    }
    matches(&split(pattern), &split(path))
}

const MARKER_RESPONSE: u8 = 0x01;
const MARKER_UNCACHEABLE: u8 = 0xFF;

/// Compact binary envelope for a cached response:
/// marker, expiry, status, headers, body.
pub fn encode_response(resp: &Response, expires_at: u64) -> Bytes {
    let body = resp.body_bytes();
    let mut out = Vec::with_capacity(64 + body.len());
    out.push(MARKER_RESPONSE);
    out.extend_from_slice(&expires_at.to_le_bytes());
    out.extend_from_slice(&resp.status.to_le_bytes());
    out.extend_from_slice(&(resp.headers.len() as u16).to_le_bytes());
    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Bytes::from(out)
}

/// Inverse of [`encode_response`]. `None` for markers, expired
/// entries, or anything malformed.
pub fn decode_response(raw: &[u8]) -> Option<Response> {
    let mut cursor = Cursor { raw, pos: 0 };
    if cursor.u8()? != MARKER_RESPONSE {
        return None;
    }
    let expires_at = cursor.u64()?;
    if expires_at != 0 && unix_now() >= expires_at {
        return None;
    }
    let status = cursor.u16()?;
    let header_count = cursor.u16()?;

    let mut headers = HeaderMap::new();
    for _ in 0..header_count {
        let name_len = cursor.u16()? as usize;
        let name = cursor.str_bytes(name_len)?;
        let value_len = cursor.u32()? as usize;
        let value = cursor.str_bytes(value_len)?;
        headers.append(name, value);
    }

    let body_len = cursor.u32()? as usize;
    let body = cursor.bytes(body_len)?;

    let mut resp = Response::new(status);
    resp.headers = headers;
    resp.body = Body::Bytes(Bytes::copy_from_slice(body));
    Some(resp)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.raw.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn str_bytes(&mut self, n: usize) -> Option<String> {
        let slice = self.bytes(n)?;
        String::from_utf8(slice.to_vec()).ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(normalize_path("/API/Users/"), "/api/users");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn fingerprint_ignores_query_order() {
        let mut one = Request::new(Method::Get, "/data");
        one.raw_query = Some("a=1&b=2".to_string());
        let mut two = Request::new(Method::Get, "/data");
        two.raw_query = Some("b=2&a=1".to_string());

        assert_eq!(
            fingerprint(Method::Get, "/data", &one, &[]),
            fingerprint(Method::Get, "/data", &two, &[])
        );
    }

    #[test]
    fn fingerprint_varies_with_selected_headers() {
        let selected = vec!["accept-encoding".to_string()];
        let mut one = Request::new(Method::Get, "/data");
        one.headers.insert("accept-encoding", "gzip");
        let mut two = Request::new(Method::Get, "/data");
        two.headers.insert("accept-encoding", "br");

        assert_ne!(
            fingerprint(Method::Get, "/data", &one, &selected),
            fingerprint(Method::Get, "/data", &two, &selected)
        );
        // Unselected headers never affect the key.
        assert_eq!(
            fingerprint(Method::Get, "/data", &one, &[]),
            fingerprint(Method::Get, "/data", &two, &[])
        );
    }

    #[test]
    fn glob_single_vs_multi_segment() {
        assert!(glob_match("/data/*", "/data/x"));
        assert!(!glob_match("/data/*", "/data/x/y"));
        assert!(glob_match("/data/**", "/data/x"));
        assert!(glob_match("/data/**", "/data/x/y/z"));
        assert!(glob_match("/data/**", "/data"));
        assert!(glob_match("/api/*/posts", "/api/42/posts"));
        assert!(!glob_match("/api/*/posts", "/api/42/comments"));
        assert!(glob_match("/exact", "/exact"));
        assert!(!glob_match("/exact", "/other"));
    }

    #[test]
    fn response_envelope_round_trip() {
        let resp = Response::text("hello").header("x-custom", "v");
        let encoded = encode_response(&resp, unix_now() + 60);
        let decoded = decode_response(&encoded).unwrap();
        assert_eq!(decoded.status, 200);
        assert_eq!(decoded.headers.get("x-custom"), Some("v"));
        assert_eq!(decoded.body_bytes(), "hello");
    }

    #[test]
    fn expired_envelope_is_a_miss() {
        let resp = Response::text("stale");
        let encoded = encode_response(&resp, unix_now().saturating_sub(10));
        assert!(decode_response(&encoded).is_none());
    }

    #[test]
    fn marker_is_not_a_response() {
        assert!(decode_response(&[MARKER_UNCACHEABLE]).is_none());
        assert!(decode_response(&[]).is_none());
    }

    #[test]
    fn rule_matching_respects_method() {
        let cache = ResponseCache::new(vec![CacheRule::new(
            "/data/**",
            Duration::from_secs(60),
        )]);
        assert!(cache.matching_rule(Method::Get, "/data/x").is_some());
        assert!(cache.matching_rule(Method::Post, "/data/x").is_none());
        assert!(cache.matching_rule(Method::Get, "/other").is_none());
    }
}
