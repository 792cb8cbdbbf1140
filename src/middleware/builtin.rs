//! Standard middleware: logging, metrics, error handling, auth, rate limiting.

use super::{Context, Middleware, Next, Pipeline, Response};
use crate::error::GatewayError;
use crate::time::{Clock, MonotonicClock};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Logs requests on entry and status/duration on exit, and assigns the
/// request id other middleware and handlers can correlate on.
pub struct LoggingMiddleware {
    exclude_paths: HashSet<String>,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self {
            exclude_paths: ["/health", "/metrics"].iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of paths that are not logged.
    pub fn exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, GatewayError> {
        let request_id: String = uuid::Uuid::new_v4().to_string()[..8].to_string();
        ctx.data.insert("request_id".into(), json!(request_id));

        let quiet = self.exclude_paths.contains(ctx.path());
        if !quiet {
            tracing::info!(request_id, method = ctx.method(), path = ctx.path(), "request");
        }

        let started = Instant::now();
        match next.run(ctx).await {
            Ok(response) => {
                if !quiet {
                    tracing::info!(
                        request_id,
                        status = response.status,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "response"
                    );
                }
                Ok(response)
            }
            Err(e) => {
                tracing::error!(
                    request_id,
                    error = %e,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "request failed"
                );
                Err(e)
            }
        }
    }
}

/// Per-path timing summary.
#[derive(Debug, Clone, Default)]
pub struct PathMetrics {
    pub count: u64,
    pub avg_ms: f64,
}

/// Snapshot of collected request metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsReport {
    pub total_requests: u64,
    pub avg_duration_ms: f64,
    pub status_counts: HashMap<u16, u64>,
    pub paths: HashMap<String, PathMetrics>,
}

#[derive(Default)]
struct MetricsState {
    total_requests: u64,
    total_duration_ms: f64,
    status_counts: HashMap<u16, u64>,
    path_timings: HashMap<String, Vec<f64>>,
}

/// Records wall time per path and response status counters. The duration is
/// stamped into the context even when the downstream chain fails.
#[derive(Default)]
pub struct MetricsMiddleware {
    state: Mutex<MetricsState>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> MetricsReport {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let avg = if state.total_requests == 0 {
            0.0
        } else {
            state.total_duration_ms / state.total_requests as f64
        };
        MetricsReport {
            total_requests: state.total_requests,
            avg_duration_ms: avg,
            status_counts: state.status_counts.clone(),
            paths: state
                .path_timings
                .iter()
                .map(|(path, timings)| {
                    let count = timings.len() as u64;
                    let avg_ms = if timings.is_empty() {
                        0.0
                    } else {
                        timings.iter().sum::<f64>() / timings.len() as f64
                    };
                    (path.clone(), PathMetrics { count, avg_ms })
                })
                .collect(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = MetricsState::default();
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        99
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, GatewayError> {
        let started = Instant::now();
        let path = ctx.path().to_string();
        let result = next.run(ctx).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        ctx.data.insert("duration_ms".into(), json!(duration_ms));

        match result {
            Ok(response) => {
                ctx.data.insert("response_status".into(), json!(response.status));
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                state.total_requests += 1;
                state.total_duration_ms += duration_ms;
                *state.status_counts.entry(response.status).or_insert(0) += 1;
                let timings = state.path_timings.entry(path).or_default();
                timings.push(duration_ms);
                // Bound memory per path.
                if timings.len() > 1000 {
                    let excess = timings.len() - 1000;
                    timings.drain(..excess);
                }
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }
}

/// Converts downstream failures into a 500 response. Intentional aborts pass
/// through unmodified.
pub struct ErrorMiddleware {
    debug: bool,
}

impl ErrorMiddleware {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

#[async_trait]
impl Middleware for ErrorMiddleware {
    fn name(&self) -> &str {
        "error"
    }

    fn priority(&self) -> i32 {
        95
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, GatewayError> {
        match next.run(ctx).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::error!(error = %e, "unhandled pipeline error");
                if self.debug {
                    Ok(Response::error(
                        500,
                        format!("internal server error: {e}"),
                        Some(json!({ "kind": e.kind() })),
                    ))
                } else {
                    Ok(Response::error(500, "internal server error", None))
                }
            }
        }
    }
}

/// Requires an authenticated principal outside the skip list, and every
/// configured permission.
pub struct AuthMiddleware {
    required_permissions: Vec<String>,
    skip_paths: HashSet<String>,
}

impl Default for AuthMiddleware {
    fn default() -> Self {
        Self {
            required_permissions: Vec::new(),
            skip_paths: ["/health", "/docs", "/auth/login"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl AuthMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn skip_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    fn priority(&self) -> i32 {
        90
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, GatewayError> {
        if self.skip_paths.contains(ctx.path()) {
            return next.run(ctx).await;
        }

        let authenticated = ctx.user.as_ref().map(|u| u.authenticated).unwrap_or(false);
        if !authenticated {
            return Ok(Response::abort(401, "authentication required", None));
        }

        for permission in &self.required_permissions {
            if !ctx.has_permission(permission) {
                return Ok(Response::abort(
                    403,
                    format!("permission denied: {permission} required"),
                    None,
                ));
            }
        }

        next.run(ctx).await
    }
}

/// Per-principal sliding-window rate limiter: a per-minute cap plus a
/// five-second burst cap.
pub struct RateLimitMiddleware {
    requests_per_minute: u32,
    burst_size: u32,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Vec<u64>>>,
}

impl RateLimitMiddleware {
    pub fn new(requests_per_minute: u32, burst_size: u32) -> Self {
        Self::with_clock(requests_per_minute, burst_size, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(requests_per_minute: u32, burst_size: u32, clock: Arc<dyn Clock>) -> Self {
        Self { requests_per_minute, burst_size, clock, windows: Mutex::new(HashMap::new()) }
    }

    fn principal_key(ctx: &Context) -> String {
        ctx.user.as_ref().map(|u| u.id.clone()).unwrap_or_else(|| "anonymous".to_string())
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn priority(&self) -> i32 {
        80
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> Result<Response, GatewayError> {
        let key = Self::principal_key(ctx);
        let now = self.clock.now_millis();

        {
            let mut windows = self.windows.lock().unwrap_or_else(|p| p.into_inner());
            let stamps = windows.entry(key).or_default();
            stamps.retain(|&t| t + 60_000 > now);

            let minute_count = stamps.len() as u32;
            let burst_count = stamps.iter().filter(|&&t| t + 5_000 > now).count() as u32;

            ctx.data.insert(
                "rate_limit".into(),
                json!({
                    "limit": self.requests_per_minute,
                    "remaining": self.requests_per_minute.saturating_sub(minute_count),
                    "reset": (now + 60_000) / 1000,
                }),
            );

            if minute_count >= self.requests_per_minute {
                return Ok(Response::abort(
                    429,
                    "rate limit exceeded",
                    Some(json!({ "retry_after": 60, "limit": self.requests_per_minute })),
                ));
            }
            if burst_count >= self.burst_size {
                return Ok(Response::abort(
                    429,
                    "burst limit exceeded",
                    Some(json!({ "retry_after": 5, "limit": self.burst_size })),
                ));
            }

            stamps.push(now);
        }

        next.run(ctx).await
    }
}

/// Pipeline with the standard middleware set wired at its usual priorities.
pub fn standard_pipeline(
    debug: bool,
    requests_per_minute: u32,
    required_permissions: &[&str],
) -> Pipeline {
    Pipeline::new()
        .with(Arc::new(MetricsMiddleware::new()))
        .with(Arc::new(ErrorMiddleware::new(debug)))
        .with(Arc::new(LoggingMiddleware::new()))
        .with(Arc::new(
            AuthMiddleware::new().required_permissions(required_permissions.iter().copied()),
        ))
        .with(Arc::new(RateLimitMiddleware::new(requests_per_minute, 10)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Principal;
    use crate::time::ManualClock;

    async fn run(pipeline: &Pipeline, ctx: &mut Context) -> Response {
        pipeline.execute(ctx, None).await.unwrap()
    }

    #[tokio::test]
    async fn logging_assigns_a_request_id() {
        let pipeline = Pipeline::new().with(Arc::new(LoggingMiddleware::new()));
        let mut ctx = Context::new("GET", "/api/portfolio");
        run(&pipeline, &mut ctx).await;

        let id = ctx.data["request_id"].as_str().unwrap();
        assert_eq!(id.len(), 8);
    }

    #[tokio::test]
    async fn auth_rejects_anonymous_outside_skip_paths() {
        let pipeline = Pipeline::new().with(Arc::new(AuthMiddleware::new()));

        let mut ctx = Context::new("POST", "/api/trade");
        let response = run(&pipeline, &mut ctx).await;
        assert_eq!(response.status, 401);
        assert!(response.is_abort());

        let mut health = Context::new("GET", "/health");
        let response = run(&pipeline, &mut health).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn auth_enforces_required_permissions() {
        let pipeline = Pipeline::new().with(Arc::new(
            AuthMiddleware::new().required_permissions(["trade:execute"]),
        ));

        let mut denied = Context::new("POST", "/api/trade").with_user(Principal::new("u1"));
        let response = run(&pipeline, &mut denied).await;
        assert_eq!(response.status, 403);

        let mut allowed = Context::new("POST", "/api/trade")
            .with_user(Principal::new("u1").with_permissions(["trade:execute"]));
        let response = run(&pipeline, &mut allowed).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn auth_rejects_unauthenticated_principal() {
        let pipeline = Pipeline::new().with(Arc::new(AuthMiddleware::new()));
        let mut user = Principal::new("u1");
        user.authenticated = false;
        let mut ctx = Context::new("POST", "/api/trade").with_user(user);
        let response = run(&pipeline, &mut ctx).await;
        assert_eq!(response.status, 401);
    }

    #[tokio::test]
    async fn rate_limit_enforces_minute_cap() {
        let clock = Arc::new(ManualClock::new());
        let pipeline = Pipeline::new()
            .with(Arc::new(RateLimitMiddleware::with_clock(3, 10, clock.clone())));

        for _ in 0..3 {
            let mut ctx = Context::new("GET", "/x").with_user(Principal::new("u1"));
            let response = run(&pipeline, &mut ctx).await;
            assert_eq!(response.status, 200);
            clock.advance(6_000);
        }

        let mut ctx = Context::new("GET", "/x").with_user(Principal::new("u1"));
        let response = run(&pipeline, &mut ctx).await;
        assert_eq!(response.status, 429);
        assert_eq!(ctx.data["rate_limit"]["remaining"], json!(0));

        // The window slides: a minute later the first request has aged out.
        clock.advance(60_000);
        let mut ctx = Context::new("GET", "/x").with_user(Principal::new("u1"));
        let response = run(&pipeline, &mut ctx).await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn rate_limit_enforces_burst_cap() {
        let clock = Arc::new(ManualClock::new());
        let pipeline = Pipeline::new()
            .with(Arc::new(RateLimitMiddleware::with_clock(100, 2, clock.clone())));

        for _ in 0..2 {
            let mut ctx = Context::new("GET", "/x").with_user(Principal::new("u1"));
            assert_eq!(run(&pipeline, &mut ctx).await.status, 200);
        }

        let mut ctx = Context::new("GET", "/x").with_user(Principal::new("u1"));
        let response = run(&pipeline, &mut ctx).await;
        assert_eq!(response.status, 429);
        assert_eq!(response.message, "burst limit exceeded");

        // Outside the five-second burst window requests flow again.
        clock.advance(5_001);
        let mut ctx = Context::new("GET", "/x").with_user(Principal::new("u1"));
        assert_eq!(run(&pipeline, &mut ctx).await.status, 200);
    }

    #[tokio::test]
    async fn rate_limit_windows_are_per_principal() {
        let clock = Arc::new(ManualClock::new());
        let pipeline = Pipeline::new()
            .with(Arc::new(RateLimitMiddleware::with_clock(1, 10, clock.clone())));

        let mut first = Context::new("GET", "/x").with_user(Principal::new("u1"));
        assert_eq!(run(&pipeline, &mut first).await.status, 200);

        let mut blocked = Context::new("GET", "/x").with_user(Principal::new("u1"));
        assert_eq!(run(&pipeline, &mut blocked).await.status, 429);

        let mut other = Context::new("GET", "/x").with_user(Principal::new("u2"));
        assert_eq!(run(&pipeline, &mut other).await.status, 200);
    }

    #[tokio::test]
    async fn error_middleware_converts_failures_to_500() {
        struct Exploder;

        #[async_trait]
        impl Middleware for Exploder {
            fn name(&self) -> &str {
                "exploder"
            }
            fn priority(&self) -> i32 {
                10
            }
            async fn handle(
                &self,
                _ctx: &mut Context,
                _next: Next<'_>,
            ) -> Result<Response, GatewayError> {
                Err(GatewayError::Transport { kind: "connect".into(), detail: "boom".into() })
            }
        }

        let pipeline = Pipeline::new()
            .with(Arc::new(ErrorMiddleware::new(false)))
            .with(Arc::new(Exploder));

        let mut ctx = Context::new("GET", "/x");
        let response = pipeline.execute(&mut ctx, None).await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.message, "internal server error");
        assert!(!response.body.to_string().contains("boom"));

        let pipeline = Pipeline::new()
            .with(Arc::new(ErrorMiddleware::new(true)))
            .with(Arc::new(Exploder));
        let mut ctx = Context::new("GET", "/x");
        let response = pipeline.execute(&mut ctx, None).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(response.message.contains("boom"));
    }

    #[tokio::test]
    async fn error_middleware_passes_aborts_through() {
        let pipeline = Pipeline::new()
            .with(Arc::new(ErrorMiddleware::new(false)))
            .with(Arc::new(AuthMiddleware::new()));

        let mut ctx = Context::new("POST", "/api/trade");
        let response = pipeline.execute(&mut ctx, None).await.unwrap();
        assert_eq!(response.status, 401);
        assert!(response.is_abort());
    }

    #[tokio::test]
    async fn metrics_track_totals_and_paths() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let pipeline = Pipeline::new().with(metrics.clone() as Arc<dyn Middleware>);

        for _ in 0..3 {
            let mut ctx = Context::new("GET", "/api/prices");
            run(&pipeline, &mut ctx).await;
        }
        let mut ctx = Context::new("GET", "/api/portfolio");
        run(&pipeline, &mut ctx).await;
        assert!(ctx.data.contains_key("duration_ms"));
        assert_eq!(ctx.data["response_status"], json!(200));

        let report = metrics.report();
        assert_eq!(report.total_requests, 4);
        assert_eq!(report.status_counts[&200], 4);
        assert_eq!(report.paths["/api/prices"].count, 3);
        assert_eq!(report.paths["/api/portfolio"].count, 1);

        metrics.reset();
        assert_eq!(metrics.report().total_requests, 0);
    }

    #[tokio::test]
    async fn metrics_stamp_duration_on_failure() {
        struct Exploder;

        #[async_trait]
        impl Middleware for Exploder {
            fn name(&self) -> &str {
                "exploder"
            }
            fn priority(&self) -> i32 {
                10
            }
            async fn handle(
                &self,
                _ctx: &mut Context,
                _next: Next<'_>,
            ) -> Result<Response, GatewayError> {
                Err(GatewayError::Timeout { elapsed_ms: 1 })
            }
        }

        let pipeline = Pipeline::new()
            .with(Arc::new(MetricsMiddleware::new()))
            .with(Arc::new(Exploder));

        let mut ctx = Context::new("GET", "/x");
        let result = pipeline.execute(&mut ctx, None).await;
        assert!(result.is_err());
        assert!(ctx.data.contains_key("duration_ms"));
    }

    #[tokio::test]
    async fn standard_pipeline_wires_the_expected_set() {
        let pipeline = standard_pipeline(false, 60, &[]);
        assert_eq!(pipeline.len(), 5);
        for name in ["metrics", "error", "logging", "auth", "rate_limit"] {
            assert!(pipeline.get(name).is_some(), "{name} missing");
        }

        // An anonymous request to a protected path flows through logging and
        // metrics but is aborted by auth.
        let mut ctx = Context::new("POST", "/api/trade");
        let response = pipeline.execute(&mut ctx, None).await.unwrap();
        assert_eq!(response.status, 401);
        assert!(ctx.data.contains_key("request_id"));
    }
}
