use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::app::AppContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive header map. Names are normalized to lowercase on
/// insert so lookups never need to fold case.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a repeated header, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Insert, replacing any existing value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != name);
        self.entries.push((name, value.into()));
    }

    /// Append without replacing existing values.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push((name.into().to_ascii_lowercase(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        let name = name.to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A typed value extracted from a path parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Float(f) => serde_json::Value::from(*f),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Str(s) => f.write_str(s),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Path parameters extracted by the router, in pattern order.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    entries: Vec<(String, ParamValue)>,
}

impl PathParams {
    pub fn push(&mut self, name: impl Into<String>, value: ParamValue) {
        self.entries.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries past `len`; used for backtracking during matching.
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}

/// An HTTP request after parsing. Header names are lowercase; the body
/// is buffered and read once.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            raw_query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Parsed query pairs in wire order. Repeated keys are preserved.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match &self.raw_query {
            Some(q) => serde_urlencoded::from_str::<Vec<(String, String)>>(q).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// First query value under `name`, if any.
    pub fn query_value(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("content-type")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::BadRequest(format!("invalid JSON body: {}", e)))
    }

    /// Parse the body as `application/x-www-form-urlencoded` pairs.
    pub fn form(&self) -> Result<Vec<(String, String)>> {
        serde_urlencoded::from_bytes(&self.body)
            .map_err(|e| Error::BadRequest(format!("invalid form body: {}", e)))
    }

    pub fn keep_alive_requested(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            // HTTP/1.1 defaults to keep-alive.
            None => true,
        }
    }
}

/// Heterogeneous per-request storage: typed slots keyed by type, plus a
/// string-keyed JSON escape hatch for loosely-typed values.
#[derive(Default)]
pub struct Extensions {
    typed: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    meta: HashMap<String, serde_json::Value>,
}

impl Extensions {
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.typed.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.typed
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> bool {
        self.typed.remove(&TypeId::of::<T>()).is_some()
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.meta.insert(key.into(), value);
    }

    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.meta.get(key)
    }
}

/// Everything a handler or middleware sees for one request.
pub struct RequestContext {
    pub request: Request,
    pub params: PathParams,
    pub extensions: Extensions,
    /// Multipart fields, populated when the request body was
    /// `multipart/form-data`. Document order, repeats preserved.
    pub uploads: Vec<crate::multipart::UploadFile>,
    pub app: Arc<AppContext>,
    /// Absolute deadline for this request, if the server enforces one.
    pub deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(request: Request, app: Arc<AppContext>) -> Self {
        Self {
            request,
            params: PathParams::default(),
            extensions: Extensions::default(),
            uploads: Vec::new(),
            app,
            deadline: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Uploaded parts under `field`, in document order.
    pub fn uploads_named(&self, field: &str) -> Vec<&crate::multipart::UploadFile> {
        self.uploads
            .iter()
            .filter(|u| u.field_name == field)
            .collect()
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Producer side of a streamed response body. Pulled at most once, one
/// chunk per call; back-pressure is the blocking pull itself.
pub type StreamProducer = Box<dyn Iterator<Item = Bytes> + Send>;

pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream(StreamProducer),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
            // Chunked has no predefined length.
            Body::Stream(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty) || self.len() == 0
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

/// An HTTP response under construction. Headers are freely writable
/// until the serializer flushes the first byte.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Body,
    pub trailers: Vec<(String, String)>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
            trailers: Vec::new(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        let mut resp = Self::new(200);
        resp.headers.insert("content-type", "text/plain");
        resp.body = Body::Bytes(Bytes::from(body.into()));
        resp
    }

    pub fn html(body: impl Into<String>) -> Self {
        let mut resp = Self::new(200);
        resp.headers.insert("content-type", "text/html; charset=utf-8");
        resp.body = Body::Bytes(Bytes::from(body.into()));
        resp
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        Self::json_value(200, value)
    }

    pub fn json_value<T: Serialize>(status: u16, value: &T) -> Self {
        // Pre-allocate to avoid reallocs for typical small responses.
        let mut buf = Vec::with_capacity(256);
        match serde_json::to_writer(&mut buf, value) {
            Ok(()) => {
                let mut resp = Self::new(status);
                resp.headers.insert("content-type", "application/json");
                resp.body = Body::Bytes(Bytes::from(buf));
                resp
            }
            Err(_) => {
                let mut resp = Self::new(500);
                resp.headers.insert("content-type", "text/plain");
                resp.body = Body::Bytes(Bytes::from_static(b"Internal Server Error"));
                resp
            }
        }
    }

    pub fn bytes(body: impl Into<Bytes>) -> Self {
        let mut resp = Self::new(200);
        resp.headers
            .insert("content-type", "application/octet-stream");
        resp.body = Body::Bytes(body.into());
        resp
    }

    /// Streamed body: serialized with `Transfer-Encoding: chunked`, one
    /// chunk per iterator item.
    pub fn stream(iter: impl Iterator<Item = Bytes> + Send + 'static) -> Self {
        let mut resp = Self::new(200);
        resp.headers
            .insert("content-type", "application/octet-stream");
        resp.body = Body::Stream(Box::new(iter));
        resp
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn not_found() -> Self {
        Error::NotFound("no route matched".into()).into_response()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// Buffered body bytes; empty for streams.
    pub fn body_bytes(&self) -> Bytes {
        match &self.body {
            Body::Empty => Bytes::new(),
            Body::Bytes(b) => b.clone(),
            Body::Stream(_) => Bytes::new(),
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(200)
    }
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        499 => "Client Closed Request",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
