//! End-to-end tests over a real listening server and raw HTTP/1.1.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use felis::cache::{CacheRule, ResponseCache};
use felis::middleware::from_fn;
use felis::tasks::{TaskOptions, TaskState};
use felis::testing::TestServer;
use felis::{App, Error, Response};
use serde_json::json;

#[test]
fn routing_with_typed_params() {
    let mut app = App::new_for_tests();
    app.get("/users/{id:int}", |ctx| {
        let id = ctx
            .param("id")
            .and_then(|p| p.as_int())
            .ok_or_else(|| Error::Internal("missing id".into()))?;
        Ok(Response::json(&json!({ "id": id })))
    })
    .unwrap();
    let server = TestServer::start(app);

    let res = server.get("/users/42");
    assert_eq!(res.status, 200);
    assert_eq!(res.json(), json!({"id": 42}));

    // A non-integer segment fails the param branch.
    let res = server.get("/users/abc");
    assert_eq!(res.status, 404);

    let res = server.request("POST", "/users/42", &[], &[]);
    assert_eq!(res.status, 405);
    assert_eq!(res.headers.get("allow"), Some("GET, HEAD"));
}

#[test]
fn auto_head_preserves_headers_and_drops_body() {
    let mut app = App::new_for_tests();
    app.get("/ping", |_ctx| Ok(Response::text("pong"))).unwrap();
    let server = TestServer::start(app);

    let get = server.get("/ping");
    assert_eq!(get.status, 200);
    assert_eq!(get.body_text(), "pong");

    let head = server.head("/ping");
    assert_eq!(head.status, 200);
    assert_eq!(head.headers.get("content-type"), Some("text/plain"));
    assert_eq!(head.headers.get("content-length"), Some("4"));
    assert!(head.body.is_empty());
}

#[test]
fn middleware_short_circuits_before_handler() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let calls = handler_calls.clone();

    let mut app = App::new_for_tests();
    app.get("/secret", move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Response::text("classified"))
    })
    .unwrap();
    app.middleware(
        10,
        from_fn(|ctx, next| {
            if ctx.request.header("authorization").is_none() {
                return Err(Error::Unauthorized("missing credentials".into()));
            }
            next.run(ctx)
        }),
    );
    app.middleware(100, from_fn(|ctx, next| next.run(ctx)));
    let server = TestServer::start(app);

    let res = server.get("/secret");
    assert_eq!(res.status, 401);
    assert_eq!(handler_calls.load(Ordering::SeqCst), 0);

    let res = server.get_with_headers("/secret", &[("authorization", "Bearer token")]);
    assert_eq!(res.status, 200);
    assert_eq!(res.body_text(), "classified");
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn response_cache_single_flight_under_concurrency() {
    let handler_calls = Arc::new(AtomicUsize::new(0));
    let calls = handler_calls.clone();

    let mut app = App::new_for_tests();
    app.config_mut().worker_threads = 16;
    app.get("/data/{name}", move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(500));
        Ok(Response::text("expensive result"))
    })
    .unwrap();
    app.middleware(
        5,
        Arc::new(ResponseCache::new(vec![CacheRule::new(
            "/data/*",
            Duration::from_secs(60),
        )])),
    );
    let server = Arc::new(TestServer::start(app));

    let first_server = server.clone();
    let first = std::thread::spawn(move || first_server.get("/data/x"));
    std::thread::sleep(Duration::from_millis(100));

    let mut waiters = Vec::new();
    for _ in 0..10 {
        let server = server.clone();
        waiters.push(std::thread::spawn(move || server.get("/data/x")));
    }

    let first = first.join().unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(first.body_text(), "expensive result");
    for waiter in waiters {
        let res = waiter.join().unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body_text(), "expensive result");
    }
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

    // A later request hits the stored entry.
    let res = server.get("/data/x");
    assert_eq!(res.headers.get("x-cache"), Some("HIT"));
    assert_eq!(handler_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn streamed_response_preserves_pacing() {
    let mut app = App::new_for_tests();
    app.get("/stream", |_ctx| {
        let producer = [b"a\n".as_slice(), b"b\n".as_slice()]
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                if i > 0 {
                    std::thread::sleep(Duration::from_millis(200));
                }
                bytes::Bytes::from_static(chunk)
            });
        Ok(Response::stream(producer))
    })
    .unwrap();
    let server = TestServer::start(app);

    let mut stream = server.connect();
    write!(
        stream,
        "GET /stream HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n"
    )
    .unwrap();

    let started = Instant::now();
    let mut reads: Vec<(Instant, Vec<u8>)> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => reads.push((Instant::now(), chunk[..n].to_vec())),
            Err(_) => break,
        }
    }
    let total = started.elapsed();
    let raw: Vec<u8> = reads.iter().flat_map(|(_, b)| b.clone()).collect();
    let text = String::from_utf8_lossy(&raw);

    assert!(text.contains("transfer-encoding: chunked"));
    assert!(text.contains("2\r\na\n"));
    assert!(text.contains("2\r\nb\n"));
    // The inter-chunk delay is visible end-to-end.
    assert!(total >= Duration::from_millis(200), "total {:?}", total);
    let first_a = reads
        .iter()
        .position(|(_, b)| String::from_utf8_lossy(b).contains("a\n"))
        .expect("first chunk seen");
    let first_b = reads
        .iter()
        .position(|(_, b)| String::from_utf8_lossy(b).contains("b\n"))
        .expect("second chunk seen");
    assert!(first_b > first_a, "chunks arrived in separate reads");
    let gap = reads[first_b].0.duration_since(reads[first_a].0);
    assert!(gap >= Duration::from_millis(150), "gap {:?}", gap);
}

#[test]
fn task_lifecycle_via_handlers() {
    let mut app = App::new_for_tests();
    app.post("/jobs", |ctx| {
        let failures = Arc::new(AtomicU32::new(0));
        let id = ctx
            .app
            .tasks
            .submit(
                move |_task| {
                    let n = failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("flaky attempt {}", n))
                    } else {
                        Ok(json!("finished"))
                    }
                },
                TaskOptions {
                    max_attempts: Some(3),
                    retry_backoff: Some(Duration::from_millis(10)),
                    ..TaskOptions::default()
                },
            )
            .map_err(|e| Error::Unavailable(e.to_string()))?;
        Ok(Response::json(&json!({ "id": id.to_string() })))
    })
    .unwrap();
    app.get("/jobs/{id}", |ctx| {
        let id = ctx
            .param("id")
            .and_then(|p| p.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::BadRequest("bad task id".into()))?;
        match ctx.app.tasks.status(id) {
            Some(status) => Ok(Response::json(&json!({
                "state": status.state,
                "attempts": status.attempts,
            }))),
            None => Err(Error::NotFound("no such task".into())),
        }
    })
    .unwrap();
    let server = TestServer::start(app);

    let created = server.post("/jobs", "application/json", b"{}");
    assert_eq!(created.status, 200);
    let id = created.json()["id"].as_str().unwrap().to_string();

    let deadline = Instant::now() + Duration::from_secs(10);
    let final_state = loop {
        let status = server.get(&format!("/jobs/{}", id));
        assert_eq!(status.status, 200);
        let body = status.json();
        let state = body["state"].as_str().unwrap().to_string();
        if state == "succeeded" || state == "failed" {
            break body;
        }
        assert!(Instant::now() < deadline, "task never finished");
        std::thread::sleep(Duration::from_millis(25));
    };

    assert_eq!(final_state["state"], json!(TaskState::Succeeded));
    assert_eq!(final_state["attempts"], json!(3));
}

#[test]
fn bridge_runs_async_work_for_sync_handlers() {
    let mut app = App::new_for_tests();
    app.get("/bridged", |ctx| {
        let value = ctx
            .app
            .bridge()
            .run_on_runtime(
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    "from the runtime"
                },
                Duration::from_secs(5),
            )?;
        Ok(Response::text(value))
    })
    .unwrap();
    let server = TestServer::start(app);

    let res = server.get("/bridged");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_text(), "from the runtime");
}

#[test]
fn multipart_upload_reaches_the_handler() {
    let mut app = App::new_for_tests();
    app.post("/upload", |ctx| {
        let summary: Vec<_> = ctx
            .uploads
            .iter()
            .map(|u| {
                json!({
                    "field": u.field_name,
                    "filename": u.filename,
                    "size": u.size,
                })
            })
            .collect();
        Ok(Response::json(&json!({ "parts": summary })))
    })
    .unwrap();
    let server = TestServer::start(app);

    let boundary = "testing-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\ncontent-disposition: form-data; name=\"title\"\r\n\r\nhello\r\n--{b}\r\ncontent-disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\ncontent-type: text/plain\r\n\r\nfile contents\r\n--{b}--\r\n",
            b = boundary
        )
        .as_bytes(),
    );

    let res = server.post(
        "/upload",
        &format!("multipart/form-data; boundary={}", boundary),
        &body,
    );
    assert_eq!(res.status, 200);
    let parts = res.json();
    assert_eq!(parts["parts"][0]["field"], json!("title"));
    assert_eq!(parts["parts"][0]["size"], json!(5));
    assert_eq!(parts["parts"][1]["filename"], json!("a.txt"));
    assert_eq!(parts["parts"][1]["size"], json!(13));
}

#[test]
fn options_enumerates_allow() {
    let mut app = App::new_for_tests();
    app.get("/thing", |_ctx| Ok(Response::text("g"))).unwrap();
    app.post("/thing", |_ctx| Ok(Response::text("p"))).unwrap();
    let server = TestServer::start(app);

    let res = server.request("OPTIONS", "/thing", &[], &[]);
    assert_eq!(res.status, 204);
    assert_eq!(res.headers.get("allow"), Some("GET, HEAD, POST"));

    let res = server.request("OPTIONS", "*", &[], &[]);
    assert_eq!(res.status, 204);
    assert_eq!(res.headers.get("allow"), Some("GET, HEAD, POST"));
}

#[test]
fn protocol_error_responses() {
    let mut app = App::new_for_tests();
    // Small header limit so the oversized-header case fits in one
    // socket write (the server reads it whole before responding).
    app.config_mut().max_header_bytes = 1024;
    app.post("/in", |ctx| {
        Ok(Response::text(format!("{} bytes", ctx.request.body.len())))
    })
    .unwrap();
    let server = TestServer::start(app);

    // Malformed request line → 400, connection closed.
    let res = server.raw(b"NOT-HTTP\r\n\r\n");
    assert_eq!(res.status, 400);
    assert_eq!(res.headers.get("connection"), Some("close"));

    // Body over the limit → 413.
    let res = server.raw(
        format!(
            "POST /in HTTP/1.1\r\nhost: x\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            100 * 1024 * 1024
        )
        .as_bytes(),
    );
    assert_eq!(res.status, 413);

    // Oversized header block → 431.
    let mut big = Vec::from(&b"GET /in HTTP/1.1\r\nhost: x\r\nx-pad: "[..]);
    big.extend(std::iter::repeat(b'a').take(2 * 1024));
    big.extend_from_slice(b"\r\n\r\n");
    let res = server.raw(&big);
    assert_eq!(res.status, 431);

    // Errors as JSON with machine-readable codes.
    let res = server.get("/missing");
    assert_eq!(res.status, 404);
    assert_eq!(res.json()["error"], json!("NOT_FOUND"));
}

#[test]
fn validation_errors_list_fields() {
    use felis::{Field, Schema};

    let mut app = App::new_for_tests();
    app.get("/search", move |ctx| {
        let schema = Schema::new()
            .field(Field::int("page").required().min(1.0))
            .field(Field::str("q").required().min_len(2));
        let values = schema.validate_query(&ctx.request)?;
        Ok(Response::json(&values))
    })
    .unwrap();
    let server = TestServer::start(app);

    let ok = server.get("/search?page=2&q=cats");
    assert_eq!(ok.status, 200);
    assert_eq!(ok.json(), json!({"page": 2, "q": "cats"}));

    let bad = server.get("/search?page=zero");
    assert_eq!(bad.status, 422);
    let body = bad.json();
    assert_eq!(body["error"], json!("VALIDATION_ERROR"));
    let fields: Vec<String> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["field"].as_str().unwrap().to_string())
        .collect();
    assert!(fields.contains(&"page".to_string()));
    assert!(fields.contains(&"q".to_string()));
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let mut app = App::new_for_tests();
    app.get("/count", |_ctx| Ok(Response::text("ok"))).unwrap();
    let server = TestServer::start(app);

    let mut stream = server.connect();
    for _ in 0..3 {
        write!(stream, "GET /count HTTP/1.1\r\nhost: x\r\n\r\n").unwrap();
        let mut collected = Vec::new();
        let mut chunk = [0u8; 1024];
        // Read one full response (identified by its body).
        loop {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed a keep-alive connection");
            collected.extend_from_slice(&chunk[..n]);
            if collected.ends_with(b"ok") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("200 OK"));
        assert!(text.contains("connection: keep-alive"));
    }
}
