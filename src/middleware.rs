use std::sync::Arc;

use crate::error::Result;
use crate::http::{RequestContext, Response};
use crate::router::Handler;

/// A middleware intercepts a request before (and optionally after) its
/// handler. Returning a response without calling `next.run()`
/// short-circuits the chain; calling through and then editing the
/// returned response expresses post-handler behavior.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Response>;
}

impl<F> Middleware for F
where
    F: for<'a> Fn(&mut RequestContext, Next<'a>) -> Result<Response> + Send + Sync,
{
    fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> Result<Response> {
        self(ctx, next)
    }
}

/// Wrap a closure as a middleware.
///
/// ```rust,ignore
/// app.middleware(10, from_fn(|ctx, next| {
///     if ctx.request.header("authorization").is_none() {
///         return Err(Error::Unauthorized("missing token".into()));
///     }
///     next.run(ctx)
/// }));
/// ```
pub fn from_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(&mut RequestContext, Next<'a>) -> Result<Response> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One registered middleware plus its chain priority. Lower priorities
/// run first; entries with equal priority keep registration order.
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub priority: i32,
    pub inner: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    pub fn new(priority: i32, inner: Arc<dyn Middleware>) -> Self {
        Self { priority, inner }
    }
}

impl std::fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MiddlewareEntry(priority={})", self.priority)
    }
}

/// The continuation of a middleware chain: the remaining middlewares
/// and the terminal handler.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    handler: &'a Handler,
}

impl<'a> Next<'a> {
    pub fn run(self, ctx: &mut RequestContext) -> Result<Response> {
        match self.chain.split_first() {
            Some((mw, rest)) => mw.handle(
                ctx,
                Next {
                    chain: rest,
                    handler: self.handler,
                },
            ),
            None => (self.handler)(ctx),
        }
    }
}

/// Effective chain for one request: globals sorted by ascending
/// priority, then the route's own list, also sorted. Both sorts are
/// stable, so equal priorities keep registration order.
pub fn build_chain(
    globals: &[MiddlewareEntry],
    route: &[MiddlewareEntry],
) -> Vec<Arc<dyn Middleware>> {
    let mut sorted_globals: Vec<&MiddlewareEntry> = globals.iter().collect();
    sorted_globals.sort_by_key(|e| e.priority);
    let mut sorted_route: Vec<&MiddlewareEntry> = route.iter().collect();
    sorted_route.sort_by_key(|e| e.priority);

    sorted_globals
        .into_iter()
        .chain(sorted_route)
        .map(|e| e.inner.clone())
        .collect()
}

/// Run `ctx` through the chain and the terminal handler.
pub fn execute(
    chain: &[Arc<dyn Middleware>],
    handler: &Handler,
    ctx: &mut RequestContext,
) -> Result<Response> {
    Next { chain, handler }.run(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppContext;
    use crate::error::Error;
    use crate::http::{Method, Request, RequestContext};

    fn ctx() -> RequestContext {
        RequestContext::new(Request::new(Method::Get, "/"), AppContext::for_tests())
    }

    fn terminal(body: &'static str) -> Handler {
        Arc::new(move |_ctx: &mut RequestContext| Ok(Response::text(body)))
    }

    #[derive(Clone)]
    struct Recorder(std::sync::Arc<parking_lot::Mutex<Vec<&'static str>>>);

    fn recording_mw(rec: Recorder, tag: &'static str) -> Arc<dyn Middleware> {
        from_fn(move |ctx, next| {
            rec.0.lock().push(tag);
            next.run(ctx)
        })
    }

    #[test]
    fn chain_runs_in_ascending_priority_order() {
        let rec = Recorder(Default::default());
        let globals = vec![
            MiddlewareEntry::new(100, recording_mw(rec.clone(), "log")),
            MiddlewareEntry::new(10, recording_mw(rec.clone(), "auth")),
        ];
        let route = vec![MiddlewareEntry::new(50, recording_mw(rec.clone(), "route"))];

        let chain = build_chain(&globals, &route);
        let handler = terminal("ok");
        let resp = execute(&chain, &handler, &mut ctx()).unwrap();

        assert_eq!(resp.status, 200);
        // Globals first (sorted), then route middleware.
        assert_eq!(*rec.0.lock(), vec!["auth", "log", "route"]);
    }

    #[test]
    fn equal_priorities_keep_registration_order() {
        let rec = Recorder(Default::default());
        let globals = vec![
            MiddlewareEntry::new(10, recording_mw(rec.clone(), "first")),
            MiddlewareEntry::new(10, recording_mw(rec.clone(), "second")),
        ];
        let chain = build_chain(&globals, &[]);
        let handler = terminal("ok");
        execute(&chain, &handler, &mut ctx()).unwrap();
        assert_eq!(*rec.0.lock(), vec!["first", "second"]);
    }

    #[test]
    fn short_circuit_skips_rest_and_handler() {
        let rec = Recorder(Default::default());
        let globals = vec![
            MiddlewareEntry::new(
                10,
                from_fn(|_ctx, _next| Ok(Response::new(401).body("denied"))),
            ),
            MiddlewareEntry::new(20, recording_mw(rec.clone(), "never")),
        ];
        let chain = build_chain(&globals, &[]);
        let handler: Handler = Arc::new(|_ctx: &mut RequestContext| {
            panic!("handler must not run");
        });
        let resp = execute(&chain, &handler, &mut ctx()).unwrap();
        assert_eq!(resp.status, 401);
        assert!(rec.0.lock().is_empty());
    }

    #[test]
    fn post_processing_sees_handler_response() {
        let globals = vec![MiddlewareEntry::new(
            10,
            from_fn(|ctx, next| {
                let resp = next.run(ctx)?;
                Ok(resp.header("x-elapsed", "1ms"))
            }),
        )];
        let chain = build_chain(&globals, &[]);
        let handler = terminal("body");
        let resp = execute(&chain, &handler, &mut ctx()).unwrap();
        assert_eq!(resp.headers.get("x-elapsed"), Some("1ms"));
    }

    #[test]
    fn middleware_error_propagates() {
        let globals = vec![MiddlewareEntry::new(
            10,
            from_fn(|_ctx, _next| Err(Error::Unauthorized("no header".into()))),
        )];
        let chain = build_chain(&globals, &[]);
        let handler = terminal("unreached");
        let err = execute(&chain, &handler, &mut ctx()).unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn context_values_flow_downstream() {
        #[derive(Debug, PartialEq)]
        struct RequestTag(&'static str);

        let globals = vec![MiddlewareEntry::new(
            10,
            from_fn(|ctx, next| {
                ctx.extensions.insert(RequestTag("tagged"));
                next.run(ctx)
            }),
        )];
        let chain = build_chain(&globals, &[]);
        let handler: Handler = Arc::new(|ctx: &mut RequestContext| {
            let tag = ctx
                .extensions
                .get::<RequestTag>()
                .map(|t| t.0)
                .unwrap_or("missing");
            Ok(Response::text(tag))
        });
        let resp = execute(&chain, &handler, &mut ctx()).unwrap();
        assert_eq!(resp.body_bytes(), "tagged");
    }
}
