//! One-stop imports for applications built on Felis.
//!
//! ```rust,ignore
//! use felis::prelude::*;
//!
//! fn main() -> Result<()> {
//!     init_logging();
//!     let mut app = App::new();
//!     app.get("/ping", |_ctx| Ok(Response::text("pong")))?;
//!     Server::serve(app)
//! }
//! ```

pub use crate::app::{App, AppContext};
pub use crate::bridge::AsyncBridge;
pub use crate::cache::{CacheRule, ResponseCache, TieredCache};
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::http::{
    Body, HeaderMap, Method, ParamValue, Request, RequestContext, Response,
};
pub use crate::logging::{init_logging, init_logging_json, init_logging_with_level};
pub use crate::middleware::{from_fn, Middleware, MiddlewareEntry, Next};
pub use crate::multipart::{FieldRules, UploadFile, UploadPolicy};
pub use crate::server::{Server, ShutdownHandle};
pub use crate::tasks::{TaskOptions, TaskQueue, TaskState};
pub use crate::validation::{Field, Schema};
