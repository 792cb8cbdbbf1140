//! Composable middleware pipeline.
//!
//! Middleware runs as a chain of responsibility ordered by priority (higher
//! runs first and nests outermost). A middleware may mutate the context
//! before calling the rest of the chain, observe or mutate the returned
//! response, or abort by producing a response without calling `next` at all;
//! outer middleware still sees an abort response on the return trip.

mod builtin;

pub use builtin::{
    standard_pipeline, AuthMiddleware, ErrorMiddleware, LoggingMiddleware, MetricsMiddleware,
    MetricsReport, PathMetrics, RateLimitMiddleware,
};

use crate::error::GatewayError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The request half of a pipeline context.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub authenticated: bool,
    pub permissions: HashSet<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), authenticated: true, permissions: HashSet::new() }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-request context flowing through the chain.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub request: RequestParts,
    pub user: Option<Principal>,
    /// Scratch storage for middleware-set data (request id, rate limit info).
    pub data: HashMap<String, Value>,
    /// Response prepared by an earlier stage, consumed by the default handler.
    pub response: Option<Response>,
}

impl Context {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request: RequestParts {
                method: method.into(),
                path: path.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: Principal) -> Self {
        self.user = Some(user);
        self
    }

    pub fn path(&self) -> &str {
        &self.request.path
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers.get(name).map(String::as_str)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.user.as_ref().map(|u| u.permissions.contains(permission)).unwrap_or(false)
    }
}

/// Response produced by the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
    pub headers: HashMap<String, String>,
    pub message: String,
    aborted: bool,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body, headers: HashMap::new(), message: String::new(), aborted: false }
    }

    pub fn error(status: u16, message: impl Into<String>, data: Option<Value>) -> Self {
        let message = message.into();
        let mut body = json!({ "error": message });
        if let (Some(obj), Some(Value::Object(extra))) = (body.as_object_mut(), data) {
            obj.extend(extra);
        }
        Self { status, body, headers: HashMap::new(), message, aborted: false }
    }

    /// A short-circuit response. The abort mark survives the return trip so
    /// the gateway can surface it as `AbortedByMiddleware`.
    pub fn abort(status: u16, message: impl Into<String>, data: Option<Value>) -> Self {
        let mut resp = Self::error(status, message, data);
        resp.aborted = true;
        resp
    }

    pub fn is_abort(&self) -> bool {
        self.aborted
    }
}

/// Future type returned by pipeline handlers.
pub type HandlerFuture<'a> = BoxFuture<'a, Result<Response, GatewayError>>;

/// Terminal handler invoked after every middleware has run.
pub type Handler = dyn for<'c> Fn(&'c mut Context) -> HandlerFuture<'c> + Send + Sync;

/// A processing stage in the pipeline.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Ordering weight. Higher priority runs first and nests outermost.
    fn priority(&self) -> i32;

    async fn handle(
        &self,
        ctx: &mut Context,
        next: Next<'_>,
    ) -> Result<Response, GatewayError>;
}

/// Remainder of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    handler: &'a Handler,
}

impl Next<'_> {
    /// Run the rest of the chain to completion.
    pub async fn run(self, ctx: &mut Context) -> Result<Response, GatewayError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware.handle(ctx, Next { rest, handler: self.handler }).await
            }
            None => (self.handler)(ctx).await,
        }
    }
}

/// Ordered middleware chain.
///
/// Kept sorted by priority descending; equal priorities preserve registration
/// order, so execution is deterministic for a given middleware set.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        tracing::debug!(
            middleware = middleware.name(),
            priority = middleware.priority(),
            "middleware added"
        );
        self.middlewares.push(middleware);
        // Stable sort keeps registration order within equal priorities.
        self.middlewares.sort_by(|a, b| b.priority().cmp(&a.priority()));
        self
    }

    /// Builder-style `add`.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.middlewares.retain(|m| m.name() != name);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.middlewares.iter().find(|m| m.name() == name).cloned()
    }

    pub fn clear(&mut self) {
        self.middlewares.clear();
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Execute the chain, then the handler (or a default that returns the
    /// context's prepared response, or 200 with an empty body).
    pub async fn execute(
        &self,
        ctx: &mut Context,
        handler: Option<&Handler>,
    ) -> Result<Response, GatewayError> {
        let default: Box<Handler> = Box::new(|ctx: &mut Context| {
            let response = ctx.response.clone().unwrap_or_else(|| Response::ok(json!({})));
            Box::pin(async move { Ok(response) }) as HandlerFuture<'_>
        });
        let handler = handler.unwrap_or(&*default);
        Next { rest: &self.middlewares, handler }.run(ctx).await
    }
}
