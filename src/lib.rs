// ─── Global allocator: mimalloc (enable the `perf` feature) ───
// The rest of the crate never touches the allocator directly; hot
// paths simply benefit when it is switched in.
#[cfg(feature = "perf")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod app;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod multipart;
pub mod parser;
pub mod perf;
pub mod prelude;
pub mod router;
pub mod server;
pub mod stream;
pub mod tasks;
pub mod testing;
pub mod validation;

// ── Core type re-exports ───────────────────────────────────────
pub use app::{App, AppContext};
pub use bridge::AsyncBridge;
pub use cache::{CacheRule, ResponseCache, TieredCache};
pub use config::Config;
pub use error::{Error, Result};
pub use http::{Body, HeaderMap, Method, ParamValue, Request, RequestContext, Response};
pub use logging::{init_logging, init_logging_json, init_logging_with_level};
pub use middleware::{from_fn, Middleware, MiddlewareEntry, Next};
pub use multipart::{FieldRules, UploadFile, UploadPolicy};
pub use router::Router;
pub use server::{Server, ShutdownHandle};
pub use tasks::{TaskOptions, TaskQueue, TaskState};
pub use validation::{Field, Schema, ValidationError};
