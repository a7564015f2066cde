//! Application facade: route and middleware registration before
//! `serve`, plus the per-process context handlers reach through.
//! Services live behind an explicit context object, not globals; the
//! only process-wide singleton is the bridge runtime's one-shot init.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::bridge::AsyncBridge;
use crate::cache::TieredCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::{Method, Request, RequestContext, Response};
use crate::metrics::ServerMetrics;
use crate::middleware::{self, Middleware, MiddlewareEntry};
use crate::multipart::{UploadFile, UploadPolicy};
use crate::router::{Handler, Router, RouterError};
use crate::tasks::TaskQueue;

/// Shared services visible to every handler via `ctx.app`.
pub struct AppContext {
    pub config: Config,
    pub cache: Arc<TieredCache>,
    pub tasks: Arc<TaskQueue>,
    pub metrics: Arc<ServerMetrics>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let cache = Arc::new(TieredCache::new(&config.cache)?);
        let tasks = Arc::new(TaskQueue::new(&config.tasks));
        Ok(Arc::new(AppContext {
            config,
            cache,
            tasks,
            metrics: Arc::new(ServerMetrics::new()),
        }))
    }

    /// The process-wide async bridge.
    pub fn bridge(&self) -> &'static AsyncBridge {
        AsyncBridge::global()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Arc<Self> {
        let mut config = Config::default();
        config.tasks.workers = 1;
        Self::new(config).expect("test context")
    }
}

/// An application under construction: declare routes and middleware,
/// then hand it to [`crate::server::Server`]. Registration errors are
/// fatal at startup; nothing here is callable after `serve`.
pub struct App {
    config: Config,
    router: Router,
    globals: Vec<MiddlewareEntry>,
    upload_policy: Option<UploadPolicy>,
}

impl App {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        App {
            config,
            router: Router::new(),
            globals: Vec::new(),
            upload_policy: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable config access during the registration phase.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Register a handler for `(method, pattern)`.
    pub fn route<F>(&mut self, method: Method, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route_with(method, pattern, handler, Vec::new())
    }

    /// Register a handler with its own middleware list.
    pub fn route_with<F>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: F,
        middleware: Vec<MiddlewareEntry>,
    ) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        self.router
            .add(method, pattern, handler, middleware)
            .map_err(|e: RouterError| Error::Internal(e.to_string()))?;
        Ok(self)
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    pub fn patch<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Patch, pattern, handler)
    }

    pub fn head<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Head, pattern, handler)
    }

    pub fn options<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&mut RequestContext) -> Result<Response> + Send + Sync + 'static,
    {
        self.route(Method::Options, pattern, handler)
    }

    /// Attach a global middleware with the given priority (lower runs
    /// first).
    pub fn middleware(&mut self, priority: i32, mw: Arc<dyn Middleware>) -> &mut Self {
        self.globals.push(MiddlewareEntry::new(priority, mw));
        self
    }

    /// Override the upload policy derived from config.
    pub fn upload_policy(&mut self, policy: UploadPolicy) -> &mut Self {
        self.upload_policy = Some(policy);
        self
    }

    /// Freeze into the immutable runtime engine. Called by the server;
    /// public for test harnesses.
    pub fn freeze(self) -> Result<Engine> {
        let upload_policy = self
            .upload_policy
            .unwrap_or_else(|| UploadPolicy::from_config(&self.config.upload));
        let context = AppContext::new(self.config)?;
        Ok(Engine {
            router: self.router,
            globals: self.globals,
            upload_policy,
            context,
        })
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// The frozen application: immutable router and middleware table plus
/// the shared context. Matching and dispatch are lock-free.
pub struct Engine {
    router: Router,
    globals: Vec<MiddlewareEntry>,
    upload_policy: UploadPolicy,
    context: Arc<AppContext>,
}

impl Engine {
    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    pub fn upload_policy(&self) -> &UploadPolicy {
        &self.upload_policy
    }

    /// Route one parsed request through the middleware chain and its
    /// handler, mapping errors and panics to responses. Never panics.
    pub fn dispatch(&self, request: Request, uploads: Vec<UploadFile>) -> Response {
        let method = request.method;

        // OPTIONS enumeration for the whole server or one path.
        if method == Method::Options && request.path == "*" {
            return Response::no_content().header("allow", self.router.all_allowed_methods());
        }

        let matched = match self.router.match_route(method, &request.path) {
            Ok(m) => m,
            Err(Error::MethodNotAllowed { allow }) if method == Method::Options => {
                return Response::no_content().header("allow", allow);
            }
            Err(err) => return err.into_response(),
        };

        let chain = middleware::build_chain(&self.globals, matched.middleware);
        let handler = matched.handler.clone();
        let params = matched.params;

        let mut ctx = RequestContext::new(request, self.context.clone());
        ctx.params = params;
        ctx.uploads = uploads;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            middleware::execute(&chain, &handler, &mut ctx)
        }));

        match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => err.into_response(),
            Err(_) => {
                // User state never reaches the response.
                error!(path = %ctx.request.path, "handler panicked");
                Error::Internal("handler panicked".into()).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::from_fn;

    fn engine(build: impl FnOnce(&mut App)) -> Engine {
        let mut config = Config::default();
        config.tasks.workers = 1;
        let mut app = App::with_config(config);
        build(&mut app);
        app.freeze().expect("engine")
    }

    fn req(method: Method, path: &str) -> Request {
        Request::new(method, path)
    }

    #[test]
    fn dispatch_routes_to_handler() {
        let engine = engine(|app| {
            app.get("/hello", |_ctx| Ok(Response::text("hi"))).unwrap();
        });
        let resp = engine.dispatch(req(Method::Get, "/hello"), Vec::new());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_bytes(), "hi");
    }

    #[test]
    fn unknown_path_is_404_json() {
        let engine = engine(|_| {});
        let resp = engine.dispatch(req(Method::Get, "/nope"), Vec::new());
        assert_eq!(resp.status, 404);
        assert_eq!(resp.headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn wrong_method_is_405_with_allow() {
        let engine = engine(|app| {
            app.get("/only-get", |_ctx| Ok(Response::text("x"))).unwrap();
        });
        let resp = engine.dispatch(req(Method::Post, "/only-get"), Vec::new());
        assert_eq!(resp.status, 405);
        assert_eq!(resp.headers.get("allow"), Some("GET, HEAD"));
    }

    #[test]
    fn options_enumerates_methods() {
        let engine = engine(|app| {
            app.get("/thing", |_ctx| Ok(Response::text("x"))).unwrap();
            app.post("/thing", |_ctx| Ok(Response::text("y"))).unwrap();
        });
        let resp = engine.dispatch(req(Method::Options, "/thing"), Vec::new());
        assert_eq!(resp.status, 204);
        assert_eq!(resp.headers.get("allow"), Some("GET, HEAD, POST"));

        let resp = engine.dispatch(req(Method::Options, "*"), Vec::new());
        assert_eq!(resp.status, 204);
        assert_eq!(resp.headers.get("allow"), Some("GET, HEAD, POST"));
    }

    #[test]
    fn handler_error_maps_to_status() {
        let engine = engine(|app| {
            app.get("/secret", |_ctx| {
                Err(Error::Forbidden("not yours".into()))
            })
            .unwrap();
        });
        let resp = engine.dispatch(req(Method::Get, "/secret"), Vec::new());
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn handler_panic_becomes_opaque_500() {
        let engine = engine(|app| {
            app.get("/boom", |_ctx| -> Result<Response> {
                panic!("sensitive internal detail")
            })
            .unwrap();
        });
        let resp = engine.dispatch(req(Method::Get, "/boom"), Vec::new());
        assert_eq!(resp.status, 500);
        let body = resp.body_bytes();
        assert!(!std::str::from_utf8(&body).unwrap().contains("sensitive"));
    }

    #[test]
    fn global_middleware_applies_to_all_routes() {
        let engine = engine(|app| {
            app.get("/a", |_ctx| Ok(Response::text("a"))).unwrap();
            app.middleware(
                10,
                from_fn(|ctx, next| {
                    if ctx.request.header("authorization").is_none() {
                        return Err(Error::Unauthorized("missing credentials".into()));
                    }
                    next.run(ctx)
                }),
            );
        });

        let resp = engine.dispatch(req(Method::Get, "/a"), Vec::new());
        assert_eq!(resp.status, 401);

        let mut ok = req(Method::Get, "/a");
        ok.headers.insert("authorization", "Bearer x");
        let resp = engine.dispatch(ok, Vec::new());
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn duplicate_route_registration_fails() {
        let mut app = App::new();
        app.get("/dup", |_ctx| Ok(Response::text("1"))).unwrap();
        assert!(app.get("/dup", |_ctx| Ok(Response::text("2"))).is_err());
    }
}
