//! Integration-test harness: serve an [`App`] on an ephemeral port on
//! background threads and talk raw HTTP/1.1 to it.
//!
//! ```rust,ignore
//! let mut app = App::new_for_tests();
//! app.get("/ping", |_ctx| Ok(Response::text("pong")))?;
//! let server = TestServer::start(app);
//! let res = server.get("/ping");
//! assert_eq!(res.status, 200);
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::app::App;
use crate::config::Config;
use crate::http::HeaderMap;
use crate::server::{Server, ShutdownHandle};

impl App {
    /// An app bound to `127.0.0.1:0` with a small worker pool, for
    /// tests.
    pub fn new_for_tests() -> Self {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 0;
        config.worker_threads = 4;
        config.tasks.workers = 2;
        config.read_timeout = Duration::from_secs(5);
        config.keepalive_timeout = Duration::from_secs(5);
        App::with_config(config)
    }
}

/// A running server plus the handle to stop it. Panics on setup
/// failure; this is test tooling.
pub struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(app: App) -> TestServer {
        let bound = Server::bind(app).expect("failed to bind test server");
        let addr = bound.local_addr().expect("bound server has an address");
        let shutdown = bound.shutdown_handle();
        let thread = std::thread::Builder::new()
            .name("felis-test-server".to_string())
            .spawn(move || {
                let _ = bound.run();
            })
            .expect("failed to spawn test server thread");
        TestServer {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a raw connection to the server.
    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect to test server");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("set read timeout");
        stream
    }

    /// Send raw bytes on a fresh connection and collect the whole
    /// response (the request should ask for `connection: close`).
    /// Write errors are tolerated: the server may respond and close
    /// while the request is still being written.
    pub fn raw(&self, request: &[u8]) -> TestResponse {
        let mut stream = self.connect();
        let _ = stream.write_all(request);
        let mut raw = Vec::new();
        let _ = stream.read_to_end(&mut raw);
        TestResponse::parse(raw)
    }

    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> TestResponse {
        let mut req = format!("{} {} HTTP/1.1\r\nhost: {}\r\n", method, path, self.addr);
        for (name, value) in headers {
            req.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() {
            req.push_str(&format!("content-length: {}\r\n", body.len()));
        }
        req.push_str("connection: close\r\n\r\n");

        let mut bytes = req.into_bytes();
        bytes.extend_from_slice(body);
        self.raw(&bytes)
    }

    pub fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, &[], &[])
    }

    pub fn get_with_headers(&self, path: &str, headers: &[(&str, &str)]) -> TestResponse {
        self.request("GET", path, headers, &[])
    }

    pub fn head(&self, path: &str) -> TestResponse {
        self.request("HEAD", path, &[], &[])
    }

    pub fn post(&self, path: &str, content_type: &str, body: &[u8]) -> TestResponse {
        self.request("POST", path, &[("content-type", content_type)], body)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A parsed response: status, headers, and the de-framed body
/// (chunked bodies are reassembled; `raw` keeps the wire bytes).
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

impl TestResponse {
    pub fn parse(raw: Vec<u8>) -> TestResponse {
        let head_end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has a header terminator");
        let head = String::from_utf8(raw[..head_end].to_vec()).expect("response head is UTF-8");
        let mut lines = head.split("\r\n");

        let status_line = lines.next().expect("response has a status line");
        let status: u16 = status_line
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status line has a code");

        let mut headers = HeaderMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
        }

        let mut body = raw[head_end + 4..].to_vec();
        if headers
            .get("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
        {
            body = decode_chunked(&body);
        }

        TestResponse {
            status,
            headers,
            body,
            raw,
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = match raw.windows(2).position(|w| w == b"\r\n") {
            Some(i) => i,
            None => break,
        };
        let size_line = std::str::from_utf8(&raw[..line_end]).unwrap_or("0");
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        if raw.len() < start + size {
            break;
        }
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    out
}
