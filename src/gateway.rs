//! The gateway orchestrator: cache lookup, provider selection, breaker
//! admission, bounded retry, and cache fill, with aggregate statistics.

use crate::balancer::{BalanceStrategy, LoadBalancer, PoolMember};
use crate::breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
use crate::cache::{CacheConfig, CacheStats, TieredCache};
use crate::error::GatewayError;
use crate::events::{Event, EventBus, EventType};
use crate::middleware::{Context, Middleware, Pipeline, Principal};
use crate::provider::ProviderSpec;
use crate::time::{Clock, Sleeper, TokioSleeper};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Gateway-wide configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Strategy used when the caller does not pin a provider.
    pub strategy: BalanceStrategy,
    /// Breaker settings applied to every registered provider.
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    /// Client-level safety net; the per-provider timeout is authoritative.
    pub client_total_timeout: Duration,
    pub client_connect_timeout: Duration,
    /// How long `stop` waits for in-flight requests.
    pub drain_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::Weighted,
            breaker: BreakerConfig {
                failure_threshold: 5,
                success_threshold: 3,
                open_duration: Duration::from_secs(60),
                half_open_probe_limit: 3,
            },
            cache: CacheConfig::default(),
            client_total_timeout: Duration::from_secs(60),
            client_connect_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Optional knobs for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Pin a specific provider instead of consulting the balancer.
    pub provider: Option<String>,
    pub params: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub headers: HashMap<String, String>,
    /// Overrides the provider's default TTL for the cache fill.
    pub cache_ttl: Option<Duration>,
    pub skip_cache: bool,
    pub user_id: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A completed gateway response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Value,
    pub headers: HashMap<String, String>,
    /// True when served from the cache without touching any provider.
    pub cached: bool,
    pub request_id: String,
}

/// Classification of one provider's standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderStatus::Healthy => write!(f, "healthy"),
            ProviderStatus::Degraded => write!(f, "degraded"),
            ProviderStatus::Unhealthy => write!(f, "unhealthy"),
            ProviderStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Outcome of a health check across the pool.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy_providers: usize,
    pub total_providers: usize,
    pub providers: HashMap<String, bool>,
}

/// Cache hit counters as seen by the gateway.
#[derive(Debug, Clone, Default)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
}

/// Aggregate gateway statistics.
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate_pct: f64,
    pub avg_latency_ms: f64,
    pub cache: CacheCounters,
    pub circuit_breaks: u64,
    pub requests_by_provider: HashMap<String, u64>,
    pub errors_by_type: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    circuit_breaks: u64,
    total_latency_ms: f64,
    requests_by_provider: HashMap<String, u64>,
    errors_by_type: HashMap<String, u64>,
}

/// Unified API gateway over a pool of upstream providers.
///
/// Composes the cache, the load balancer, the breaker registry, and the
/// middleware pipeline. All methods take `&self`; the gateway is shared
/// behind an `Arc` between tasks.
pub struct ApiGateway {
    config: GatewayConfig,
    providers: Mutex<HashMap<String, ProviderSpec>>,
    breakers: BreakerRegistry,
    balancer: LoadBalancer,
    cache: Arc<TieredCache>,
    pipeline: Mutex<Pipeline>,
    counters: Mutex<Counters>,
    client: Mutex<Option<reqwest::Client>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    in_flight: AtomicUsize,
    sleeper: Arc<dyn Sleeper>,
    bus: Option<Arc<EventBus>>,
}

impl ApiGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let cache = Arc::new(TieredCache::new(config.cache.clone())?);
        Ok(Self {
            balancer: LoadBalancer::new(config.strategy),
            breakers: BreakerRegistry::new(),
            cache,
            providers: Mutex::new(HashMap::new()),
            pipeline: Mutex::new(Pipeline::new()),
            counters: Mutex::new(Counters::default()),
            client: Mutex::new(None),
            sweeper: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            sleeper: Arc::new(TokioSleeper),
            bus: None,
            config,
        })
    }

    /// Drive breaker cooldowns from the given clock (deterministic in tests).
    /// Apply before registering providers.
    pub fn breaker_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.breakers = BreakerRegistry::with_clock(clock);
        self
    }

    /// Replace the sleeper used between retry attempts.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Attach an event bus; the gateway then emits `api.call.*`,
    /// `error.occurred`, and `health.check.failed` events.
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Initialize the HTTP client and start the cache sweeper.
    pub fn start(&self) -> Result<(), GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(self.config.client_total_timeout)
            .connect_timeout(self.config.client_connect_timeout)
            .build()
            .map_err(|e| GatewayError::InvalidConfig(format!("http client: {e}")))?;
        *self.lock_client() = Some(client);

        let mut sweeper = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if sweeper.is_none() {
            *sweeper = Some(self.cache.spawn_sweeper());
        }

        tracing::info!("api gateway started");
        Ok(())
    }

    /// Drain in-flight requests (up to the configured grace), stop the
    /// sweeper, and release the client. Afterwards every request returns
    /// `NotStarted`.
    pub async fn stop(&self) {
        let client = self.lock_client().take();
        if client.is_none() {
            return;
        }

        let deadline = Instant::now() + self.config.drain_grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        tracing::info!("api gateway stopped");
    }

    // ------------------------------------------------------------------
    // Provider management
    // ------------------------------------------------------------------

    pub fn register_provider(&self, spec: ProviderSpec) -> Result<(), GatewayError> {
        spec.validate()?;

        self.breakers.get_or_create(&spec.name, self.config.breaker.clone());

        let mut member = PoolMember::new(&spec.name).weight(spec.weight).priority(spec.priority);
        if let Some(url) = &spec.health_url {
            member = member.health_url(url);
        }
        self.balancer.add(member);

        tracing::info!(provider = %spec.name, base_url = %spec.base_url, "provider registered");
        self.lock_providers().insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn unregister_provider(&self, name: &str) {
        self.lock_providers().remove(name);
        self.breakers.remove(name);
        self.balancer.remove(name);
        tracing::info!(provider = %name, "provider unregistered");
    }

    pub fn provider(&self, name: &str) -> Option<ProviderSpec> {
        self.lock_providers().get(name).cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_providers().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn provider_status(&self, name: &str) -> ProviderStatus {
        let Some(spec) = self.provider(name) else { return ProviderStatus::Disabled };
        if !spec.enabled {
            return ProviderStatus::Disabled;
        }
        match self.balancer.health(name) {
            None => ProviderStatus::Unhealthy,
            Some(health) if !health.is_healthy => ProviderStatus::Unhealthy,
            Some(health) if health.health_score() < 70.0 => ProviderStatus::Degraded,
            Some(_) => ProviderStatus::Healthy,
        }
    }

    /// The breaker owned by a registered provider.
    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    /// States of all provider breakers, sorted by name.
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers.snapshot()
    }

    pub fn cache(&self) -> Arc<TieredCache> {
        Arc::clone(&self.cache)
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    // ------------------------------------------------------------------
    // Middleware
    // ------------------------------------------------------------------

    /// Add a middleware to the outbound pipeline. It runs after the cache
    /// lookup and before breaker admission, so cached responses skip it and
    /// admitted requests carry fully resolved headers.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.lock_pipeline().add(middleware);
    }

    pub fn remove_middleware(&self, name: &str) {
        self.lock_pipeline().remove(name);
    }

    pub fn set_pipeline(&self, pipeline: Pipeline) {
        *self.lock_pipeline() = pipeline;
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub async fn get(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        self.request("GET", path, opts).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: Value,
        opts: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        self.request("POST", path, RequestOptions { body: Some(body), ..opts }).await
    }

    pub async fn put(
        &self,
        path: &str,
        body: Value,
        opts: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        self.request("PUT", path, RequestOptions { body: Some(body), ..opts }).await
    }

    pub async fn delete(
        &self,
        path: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        self.request("DELETE", path, opts).await
    }

    /// Make a mediated request to an upstream provider.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        opts: RequestOptions,
    ) -> Result<ApiResponse, GatewayError> {
        let client = self.lock_client().clone().ok_or(GatewayError::NotStarted)?;
        let request_id = uuid::Uuid::new_v4().to_string();

        self.lock_counters().total_requests += 1;
        let _guard = InFlightGuard::enter(&self.in_flight);
        let started = Instant::now();

        if let Some(bus) = &self.bus {
            let mut event = Event::new(
                EventType::ApiCallStarted.as_str(),
                json!({ "endpoint": path, "method": method, "request_id": request_id }),
            )
            .source("gateway");
            if let Some(user) = &opts.user_id {
                event = event.user_id(user.clone());
            }
            bus.publish(event).await;
        }

        let result = self.dispatch(&client, method, path, &opts, &request_id).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut counters = self.lock_counters();
            counters.total_latency_ms += duration_ms;
            match &result {
                Ok(_) => counters.successful_requests += 1,
                Err(e) => {
                    counters.failed_requests += 1;
                    if e.is_circuit_open() {
                        counters.circuit_breaks += 1;
                    } else {
                        *counters.errors_by_type.entry(e.kind().to_string()).or_insert(0) += 1;
                    }
                }
            }
        }

        if let Some(bus) = &self.bus {
            let mut data = json!({
                "endpoint": path,
                "method": method,
                "request_id": request_id,
                "duration_ms": duration_ms,
            });
            match &result {
                Ok(response) => {
                    data["status_code"] = json!(response.status);
                    data["cached"] = json!(response.cached);
                }
                Err(e) => data["error"] = json!(e.kind()),
            }
            bus.publish(
                Event::new(EventType::ApiCallCompleted.as_str(), data).source("gateway"),
            )
            .await;

            if let Err(e) = &result {
                bus.publish(
                    Event::new(
                        EventType::ErrorOccurred.as_str(),
                        json!({
                            "endpoint": path,
                            "request_id": request_id,
                            "error": e.to_string(),
                            "kind": e.kind(),
                        }),
                    )
                    .source("gateway"),
                )
                .await;
            }
        }

        result
    }

    async fn dispatch(
        &self,
        client: &reqwest::Client,
        method: &str,
        path: &str,
        opts: &RequestOptions,
        request_id: &str,
    ) -> Result<ApiResponse, GatewayError> {
        let method = method.to_uppercase();
        let cacheable = method == "GET" && !opts.skip_cache;

        let cache_key = cacheable.then(|| {
            TieredCache::request_key(&method, path, &opts.params, opts.body.as_ref())
        });

        if let Some(key) = &cache_key {
            if let Some(data) = self.cache.get(key, "default") {
                self.lock_counters().cache_hits += 1;
                return Ok(ApiResponse {
                    status: 200,
                    data,
                    headers: HashMap::new(),
                    cached: true,
                    request_id: request_id.to_string(),
                });
            }
            self.lock_counters().cache_misses += 1;
        }

        let provider = match &opts.provider {
            Some(name) => {
                let spec = self
                    .provider(name)
                    .ok_or_else(|| GatewayError::UnknownProvider(name.clone()))?;
                if !spec.enabled {
                    return Err(GatewayError::InvalidConfig(format!(
                        "provider '{name}' is disabled"
                    )));
                }
                spec
            }
            None => {
                let name = self.balancer.select()?;
                self.provider(&name).ok_or(GatewayError::UnknownProvider(name))?
            }
        };

        // Provider statics first, then caller headers, then the API key.
        let mut headers = provider.headers.clone();
        headers.extend(opts.headers.clone());
        if let Some(value) = provider.api_key_value() {
            headers.insert(provider.api_key_header.clone(), value);
        }
        let mut body = opts.body.clone();

        let pipeline = self.lock_pipeline().clone();
        if !pipeline.is_empty() {
            let mut ctx = Context::new(method.clone(), path);
            ctx.request.headers = headers;
            ctx.request.body = body;
            if let Some(user) = &opts.user_id {
                ctx.user = Some(Principal::new(user.clone()));
            }
            ctx.data.insert("request_id".into(), json!(request_id));
            ctx.data.insert("provider".into(), json!(provider.name));

            let response = pipeline.execute(&mut ctx, None).await?;
            if response.is_abort() {
                return Err(GatewayError::AbortedByMiddleware {
                    status: response.status,
                    message: response.message,
                });
            }
            headers = ctx.request.headers;
            body = ctx.request.body;
        }

        let url = format!("{}{}", provider.base_url, path);
        let (status, data, response_headers) = self
            .execute_with_retry(client, &provider, &method, &url, &opts.params, body.as_ref(), &headers)
            .await?;

        if let Some(key) = &cache_key {
            if (200..300).contains(&status) {
                let ttl = opts.cache_ttl.unwrap_or(provider.cache_ttl);
                self.cache.set(key, data.clone(), Some(ttl), &[], "default");
            }
        }

        Ok(ApiResponse {
            status,
            data,
            headers: response_headers,
            cached: false,
            request_id: request_id.to_string(),
        })
    }

    /// Bounded same-provider retry with exponential backoff. Breaker and
    /// balancer accounting happens here and nowhere else.
    async fn execute_with_retry(
        &self,
        client: &reqwest::Client,
        provider: &ProviderSpec,
        method: &str,
        url: &str,
        params: &BTreeMap<String, String>,
        body: Option<&Value>,
        headers: &HashMap<String, String>,
    ) -> Result<(u16, Value, HashMap<String, String>), GatewayError> {
        let breaker = self.breakers.get_or_create(&provider.name, self.config.breaker.clone());
        let mut last_error = None;

        for attempt in 0..provider.retry_attempts {
            // A breaker rejection is returned as-is: it is not an upstream
            // failure and is never retried.
            breaker.try_admit()?;
            self.balancer.on_request_start(&provider.name);

            let attempt_started = Instant::now();
            match self.perform(client, provider, method, url, params, body, headers).await {
                Ok((status, data, response_headers)) => {
                    let latency_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;
                    self.balancer.on_request_success(&provider.name, latency_ms);
                    breaker.on_success();
                    *self
                        .lock_counters()
                        .requests_by_provider
                        .entry(provider.name.clone())
                        .or_insert(0) += 1;
                    return Ok((status, data, response_headers));
                }
                Err(e) => {
                    self.balancer.on_request_failure(&provider.name);
                    breaker.on_failure();
                    tracing::warn!(
                        provider = %provider.name,
                        attempt = attempt + 1,
                        attempts = provider.retry_attempts,
                        error = %e,
                        "upstream request failed"
                    );
                    last_error = Some(e);

                    if attempt + 1 < provider.retry_attempts {
                        let backoff = provider
                            .retry_delay
                            .checked_mul(2u32.saturating_pow(attempt))
                            .unwrap_or(Duration::MAX);
                        self.sleeper.sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(GatewayError::Transport {
            kind: "retry".into(),
            detail: "all attempts failed".into(),
        }))
    }

    async fn perform(
        &self,
        client: &reqwest::Client,
        provider: &ProviderSpec,
        method: &str,
        url: &str,
        params: &BTreeMap<String, String>,
        body: Option<&Value>,
        headers: &HashMap<String, String>,
    ) -> Result<(u16, Value, HashMap<String, String>), GatewayError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| GatewayError::InvalidConfig(format!("invalid method '{method}'")))?;

        let mut request = client.request(method, url).timeout(provider.timeout);
        if !params.is_empty() {
            request = request.query(params);
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let started = Instant::now();
        let response =
            request.send().await.map_err(|e| map_transport_error(e, started.elapsed()))?;

        let status = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let text =
            response.text().await.map_err(|e| map_transport_error(e, started.elapsed()))?;
        let data: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));

        if status >= 400 {
            return Err(GatewayError::UpstreamStatus { status, body: text });
        }
        Ok((status, data, response_headers))
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Probe every provider and report per-provider health.
    pub async fn health_check(&self) -> Result<HealthReport, GatewayError> {
        let client = self.lock_client().clone().ok_or(GatewayError::NotStarted)?;
        let providers = self.balancer.probe_all(&client).await;

        if let Some(bus) = &self.bus {
            for (name, healthy) in &providers {
                if !healthy {
                    bus.publish(
                        Event::new(
                            EventType::HealthCheckFailed.as_str(),
                            json!({ "provider": name }),
                        )
                        .source("gateway"),
                    )
                    .await;
                }
            }
        }

        Ok(HealthReport {
            healthy_providers: providers.values().filter(|h| **h).count(),
            total_providers: providers.len(),
            providers,
        })
    }

    pub fn get_stats(&self) -> StatsReport {
        let counters = self.lock_counters();
        let success_rate_pct = if counters.total_requests == 0 {
            100.0
        } else {
            counters.successful_requests as f64 / counters.total_requests as f64 * 100.0
        };
        let avg_latency_ms = if counters.total_requests == 0 {
            0.0
        } else {
            counters.total_latency_ms / counters.total_requests as f64
        };
        let cache_total = counters.cache_hits + counters.cache_misses;
        let hit_rate_pct = if cache_total == 0 {
            0.0
        } else {
            counters.cache_hits as f64 / cache_total as f64 * 100.0
        };

        StatsReport {
            total_requests: counters.total_requests,
            successful_requests: counters.successful_requests,
            failed_requests: counters.failed_requests,
            success_rate_pct,
            avg_latency_ms,
            cache: CacheCounters {
                hits: counters.cache_hits,
                misses: counters.cache_misses,
                hit_rate_pct,
            },
            circuit_breaks: counters.circuit_breaks,
            requests_by_provider: counters.requests_by_provider.clone(),
            errors_by_type: counters.errors_by_type.clone(),
        }
    }

    /// Statistics of the underlying cache tiers.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn lock_providers(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderSpec>> {
        self.providers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_pipeline(&self) -> std::sync::MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_client(&self) -> std::sync::MutexGuard<'_, Option<reqwest::Client>> {
        self.client.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn map_transport_error(e: reqwest::Error, elapsed: Duration) -> GatewayError {
    if e.is_timeout() {
        return GatewayError::Timeout { elapsed_ms: elapsed.as_millis() as u64 };
    }
    let kind = if e.is_connect() {
        "connect"
    } else if e.is_request() {
        "request"
    } else if e.is_decode() {
        "decode"
    } else {
        "transport"
    };
    GatewayError::Transport { kind: kind.into(), detail: e.to_string() }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
