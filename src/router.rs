use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::error::{Error as HttpError, Result as HttpResult};
use crate::http::{Method, ParamValue, PathParams, RequestContext, Response};
use crate::middleware::MiddlewareEntry;

/// Terminal request handler.
pub type Handler = Arc<dyn Fn(&mut RequestContext) -> HttpResult<Response> + Send + Sync>;

/// Route registration failure. All variants are fatal at startup.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("duplicate route: {method} {pattern}")]
    DuplicateRoute { method: Method, pattern: String },

    #[error("conflicting parameter at {pattern}: {existing} vs {new}")]
    ParamConflict {
        pattern: String,
        existing: String,
        new: String,
    },

    #[error("invalid route pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Str,
    Int,
    Float,
}

impl ParamKind {
    fn coerce(&self, segment: &str) -> Option<ParamValue> {
        match self {
            ParamKind::Str => Some(ParamValue::Str(segment.to_string())),
            ParamKind::Int => segment.parse::<i64>().ok().map(ParamValue::Int),
            ParamKind::Float => segment.parse::<f64>().ok().map(ParamValue::Float),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
        }
    }
}

struct Endpoint {
    handler: Handler,
    middleware: Vec<MiddlewareEntry>,
}

struct ParamChild {
    name: String,
    kind: ParamKind,
    node: RouteNode,
}

/// Tail matcher: `*name` or `{name:path}`. Consumes the remainder of
/// the path including `/`.
struct TailChild {
    name: String,
    handlers: HashMap<Method, Endpoint>,
}

#[derive(Default)]
struct RouteNode {
    path: String,
    children: Vec<RouteNode>,
    // At most one param child and one tail child per node.
    param: Option<Box<ParamChild>>,
    tail: Option<Box<TailChild>>,
    handlers: HashMap<Method, Endpoint>,
}

impl RouteNode {
    fn new(path: String) -> Self {
        RouteNode {
            path,
            ..Default::default()
        }
    }
}

/// A successful route match.
pub struct RouteMatch<'r> {
    pub handler: &'r Handler,
    pub middleware: &'r [MiddlewareEntry],
    pub params: PathParams,
}

enum Segment {
    Static(String),
    Param { name: String, kind: ParamKind },
    Tail { name: String },
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouterError> {
    let mut out = Vec::new();
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();

    for (i, seg) in raw.iter().enumerate() {
        let parsed = if let Some(inner) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let (name, ty) = match inner.split_once(':') {
                Some((n, t)) => (n, t),
                None => (inner, "string"),
            };
            if name.is_empty() {
                return Err(RouterError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "empty parameter name".to_string(),
                });
            }
            match ty {
                "string" => Segment::Param {
                    name: name.to_string(),
                    kind: ParamKind::Str,
                },
                "int" => Segment::Param {
                    name: name.to_string(),
                    kind: ParamKind::Int,
                },
                "float" => Segment::Param {
                    name: name.to_string(),
                    kind: ParamKind::Float,
                },
                "path" => Segment::Tail {
                    name: name.to_string(),
                },
                other => {
                    return Err(RouterError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: format!("unknown parameter type '{}'", other),
                    })
                }
            }
        } else if let Some(name) = seg.strip_prefix('*') {
            if name.is_empty() {
                return Err(RouterError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "wildcard needs a name".to_string(),
                });
            }
            Segment::Tail {
                name: name.to_string(),
            }
        } else {
            Segment::Static(seg.to_string())
        };

        if matches!(parsed, Segment::Tail { .. }) && i + 1 != raw.len() {
            return Err(RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "tail segment must be last".to_string(),
            });
        }
        out.push(parsed);
    }
    Ok(out)
}

/// Segment-trie router. Registration happens before `serve`; matching
/// is read-only and lock-free afterwards.
#[derive(Default)]
pub struct Router {
    root: RouteNode,
}

impl Router {
    pub fn new() -> Self {
        Router {
            root: RouteNode::new(String::new()),
        }
    }

    /// Register `handler` for `(method, pattern)` with its per-route
    /// middleware. Duplicate registration is an error.
    pub fn add(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareEntry>,
    ) -> Result<(), RouterError> {
        let segments = parse_pattern(pattern)?;
        let mut current = &mut self.root;

        for segment in segments {
            match segment {
                Segment::Static(text) => {
                    let idx = current.children.iter().position(|c| c.path == text);
                    current = match idx {
                        Some(i) => &mut current.children[i],
                        None => {
                            current.children.push(RouteNode::new(text));
                            current.children.last_mut().ok_or_else(|| {
                                RouterError::InvalidPattern {
                                    pattern: pattern.to_string(),
                                    reason: "trie insertion failed".to_string(),
                                }
                            })?
                        }
                    };
                }
                Segment::Param { name, kind } => {
                    let param = current.param.get_or_insert_with(|| {
                        Box::new(ParamChild {
                            name: name.clone(),
                            kind,
                            node: RouteNode::default(),
                        })
                    });
                    if param.name != name || param.kind != kind {
                        return Err(RouterError::ParamConflict {
                            pattern: pattern.to_string(),
                            existing: format!("{{{}:{}}}", param.name, param.kind.name()),
                            new: format!("{{{}:{}}}", name, kind.name()),
                        });
                    }
                    current = &mut param.node;
                }
                Segment::Tail { name } => {
                    let tail = current.tail.get_or_insert_with(|| {
                        Box::new(TailChild {
                            name: name.clone(),
                            handlers: HashMap::new(),
                        })
                    });
                    if tail.name != name {
                        return Err(RouterError::ParamConflict {
                            pattern: pattern.to_string(),
                            existing: format!("*{}", tail.name),
                            new: format!("*{}", name),
                        });
                    }
                    if tail.handlers.contains_key(&method) {
                        return Err(RouterError::DuplicateRoute {
                            method,
                            pattern: pattern.to_string(),
                        });
                    }
                    tail.handlers.insert(
                        method,
                        Endpoint {
                            handler,
                            middleware,
                        },
                    );
                    return Ok(());
                }
            }
        }

        if current.handlers.contains_key(&method) {
            return Err(RouterError::DuplicateRoute {
                method,
                pattern: pattern.to_string(),
            });
        }
        current.handlers.insert(
            method,
            Endpoint {
                handler,
                middleware,
            },
        );
        Ok(())
    }

    /// Match `(method, path)`, extracting typed parameters.
    ///
    /// `HEAD` falls back to the node's `GET` handler when no explicit
    /// `HEAD` registration exists; the serializer is responsible for
    /// dropping the body.
    pub fn match_route(&self, method: Method, path: &str) -> HttpResult<RouteMatch<'_>> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = PathParams::default();

        let handlers = match Self::walk(&self.root, &segments, 0, &mut params) {
            Some(h) => h,
            None => return Err(HttpError::NotFound(format!("no route for {}", path))),
        };

        let endpoint = handlers.get(&method).or_else(|| {
            if method == Method::Head {
                handlers.get(&Method::Get)
            } else {
                None
            }
        });

        match endpoint {
            Some(ep) => Ok(RouteMatch {
                handler: &ep.handler,
                middleware: &ep.middleware,
                params,
            }),
            None => Err(HttpError::MethodNotAllowed {
                allow: allow_header(handlers),
            }),
        }
    }

    /// `Allow` enumeration for a path, or `None` if it matches nothing.
    pub fn allowed_methods(&self, path: &str) -> Option<String> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = PathParams::default();
        Self::walk(&self.root, &segments, 0, &mut params).map(allow_header)
    }

    /// Union of methods registered anywhere, for `OPTIONS *`.
    pub fn all_allowed_methods(&self) -> String {
        fn collect(node: &RouteNode, set: &mut Vec<Method>) {
            for m in node.handlers.keys() {
                if !set.contains(m) {
                    set.push(*m);
                }
            }
            if let Some(tail) = &node.tail {
                for m in tail.handlers.keys() {
                    if !set.contains(m) {
                        set.push(*m);
                    }
                }
            }
            if let Some(param) = &node.param {
                collect(&param.node, set);
            }
            for child in &node.children {
                collect(child, set);
            }
        }
        let mut methods = Vec::new();
        collect(&self.root, &mut methods);
        format_allow(&methods)
    }

    fn walk<'r>(
        node: &'r RouteNode,
        segments: &[&str],
        depth: usize,
        params: &mut PathParams,
    ) -> Option<&'r HashMap<Method, Endpoint>> {
        if depth == segments.len() {
            if node.handlers.is_empty() {
                return None;
            }
            return Some(&node.handlers);
        }

        let segment = segments[depth];

        // Exact static match wins.
        for child in &node.children {
            if child.path == segment {
                if let Some(found) = Self::walk(child, segments, depth + 1, params) {
                    return Some(found);
                }
            }
        }

        // Param child; a failed coercion fails this branch.
        if let Some(param) = &node.param {
            if let Some(value) = param.kind.coerce(segment) {
                let mark = params.len();
                params.push(param.name.clone(), value);
                if let Some(found) = Self::walk(&param.node, segments, depth + 1, params) {
                    return Some(found);
                }
                params.truncate(mark);
            }
        }

        // Tail consumes the remainder including '/'.
        if let Some(tail) = &node.tail {
            if tail.handlers.is_empty() {
                return None;
            }
            let remainder = segments[depth..].join("/");
            params.push(tail.name.clone(), ParamValue::Str(remainder));
            return Some(&tail.handlers);
        }

        None
    }
}

// Deterministic Allow ordering: GET, HEAD, then the rest.
const METHOD_ORDER: [Method; 9] = [
    Method::Get,
    Method::Head,
    Method::Post,
    Method::Put,
    Method::Patch,
    Method::Delete,
    Method::Options,
    Method::Trace,
    Method::Connect,
];

fn allow_header(handlers: &HashMap<Method, Endpoint>) -> String {
    let mut methods: Vec<Method> = handlers.keys().copied().collect();
    if handlers.contains_key(&Method::Get) && !handlers.contains_key(&Method::Head) {
        methods.push(Method::Head);
    }
    format_allow(&methods)
}

fn format_allow(methods: &[Method]) -> String {
    let mut out: Vec<&'static str> = Vec::with_capacity(methods.len() + 1);
    for m in METHOD_ORDER {
        if methods.contains(&m) {
            out.push(m.as_str());
        }
    }
    if methods.contains(&Method::Get) && !out.contains(&"HEAD") {
        // Auto-HEAD accompanies every GET.
        out.insert(1, "HEAD");
    }
    out.join(", ")
}
