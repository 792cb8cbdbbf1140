//! Load balancer distributing requests across upstream providers.
//!
//! Selection consults per-provider health records maintained from request
//! outcomes; unhealthy providers are excluded until they recover.

use crate::error::GatewayError;
use crate::time::epoch_millis;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Latency smoothing factor for the moving average.
const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Strategies for picking a provider from the healthy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceStrategy {
    /// Rotate through healthy providers in registration order.
    RoundRobin,
    /// Sample healthy providers with probability proportional to weight.
    #[default]
    Weighted,
    /// Pick the healthy provider with the fewest active connections.
    LeastConnections,
    /// Pick the healthy provider with the lowest average latency.
    LatencyBased,
    /// Pick the healthy provider with the lowest priority number.
    Failover,
    /// Uniform random choice over healthy providers.
    Random,
}

/// Registration record for one provider in the pool.
#[derive(Debug, Clone)]
pub struct PoolMember {
    pub name: String,
    /// Relative weight for the weighted strategy.
    pub weight: u32,
    /// Failover preference, lower wins.
    pub priority: i32,
    /// Optional URL probed by `probe_all`.
    pub health_url: Option<String>,
    /// Consecutive failures before the provider is marked unhealthy.
    pub failure_threshold: u32,
    /// Consecutive successes before an unhealthy provider recovers.
    pub recovery_threshold: u32,
}

impl PoolMember {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: 100,
            priority: 0,
            health_url: None,
            failure_threshold: 3,
            recovery_threshold: 2,
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn recovery_threshold(mut self, n: u32) -> Self {
        self.recovery_threshold = n;
        self
    }
}

/// Health record maintained per provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderHealth {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub avg_latency_ms: f64,
    pub active_connections: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_check_ms: Option<u64>,
}

impl ProviderHealth {
    fn new() -> Self {
        Self { is_healthy: true, ..Default::default() }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64
    }

    /// Derived quality metric in `[0, 100]`.
    pub fn health_score(&self) -> f64 {
        if !self.is_healthy {
            return 0.0;
        }

        let mut score = 100.0;
        score -= (self.consecutive_failures as f64 * 10.0).min(50.0);
        if self.avg_latency_ms > 1000.0 {
            score -= 20.0;
        } else if self.avg_latency_ms > 500.0 {
            score -= 10.0;
        }
        score -= (1.0 - self.success_rate()) * 30.0;

        score.clamp(0.0, 100.0)
    }
}

struct Inner {
    /// Registration order, the tie-breaker for deterministic strategies.
    order: Vec<String>,
    members: HashMap<String, PoolMember>,
    health: HashMap<String, ProviderHealth>,
    rr_index: usize,
}

/// Load balancer over a pool of named providers.
///
/// A single lock guards the pool, the health records, and the round-robin
/// cursor, so `select` is atomic with respect to health updates.
pub struct LoadBalancer {
    strategy: BalanceStrategy,
    inner: Mutex<Inner>,
}

impl LoadBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            inner: Mutex::new(Inner {
                order: Vec::new(),
                members: HashMap::new(),
                health: HashMap::new(),
                rr_index: 0,
            }),
        }
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Add a provider to the pool. Re-adding a name replaces its config but
    /// keeps its health record.
    pub fn add(&self, member: PoolMember) {
        let mut inner = self.lock();
        let name = member.name.clone();
        if !inner.members.contains_key(&name) {
            inner.order.push(name.clone());
            inner.health.insert(name.clone(), ProviderHealth::new());
        }
        inner.members.insert(name.clone(), member);
        tracing::info!(provider = %name, "provider added to pool");
    }

    pub fn remove(&self, name: &str) {
        let mut inner = self.lock();
        inner.order.retain(|n| n != name);
        inner.members.remove(name);
        inner.health.remove(name);
        tracing::info!(provider = %name, "provider removed from pool");
    }

    /// Names of providers currently marked healthy, in registration order.
    pub fn healthy_providers(&self) -> Vec<String> {
        let inner = self.lock();
        healthy_of(&inner).into_iter().map(String::from).collect()
    }

    pub fn health(&self, name: &str) -> Option<ProviderHealth> {
        self.lock().health.get(name).cloned()
    }

    /// Select a provider according to the configured strategy.
    pub fn select(&self) -> Result<String, GatewayError> {
        let mut inner = self.lock();
        let healthy: Vec<String> = healthy_of(&inner).into_iter().map(String::from).collect();
        if healthy.is_empty() {
            tracing::warn!("no healthy providers available");
            return Err(GatewayError::NoHealthyProvider);
        }

        let picked = match self.strategy {
            BalanceStrategy::RoundRobin => {
                inner.rr_index = (inner.rr_index + 1) % healthy.len();
                healthy[inner.rr_index].clone()
            }
            BalanceStrategy::Weighted => {
                let weights: Vec<u64> = healthy
                    .iter()
                    .map(|n| u64::from(inner.members[n].weight.max(1)))
                    .collect();
                let total: u64 = weights.iter().sum();
                let mut roll = rand::rng().random_range(0..total);
                let mut chosen = healthy.len() - 1;
                for (i, w) in weights.iter().enumerate() {
                    if roll < *w {
                        chosen = i;
                        break;
                    }
                    roll -= w;
                }
                healthy[chosen].clone()
            }
            BalanceStrategy::LeastConnections => healthy
                .iter()
                .min_by_key(|n| inner.health[*n].active_connections)
                .expect("healthy pool is non-empty")
                .clone(),
            BalanceStrategy::LatencyBased => healthy
                .iter()
                .min_by(|a, b| {
                    let la = inner.health[*a].avg_latency_ms;
                    let lb = inner.health[*b].avg_latency_ms;
                    la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("healthy pool is non-empty")
                .clone(),
            BalanceStrategy::Failover => healthy
                .iter()
                .min_by_key(|n| inner.members[*n].priority)
                .expect("healthy pool is non-empty")
                .clone(),
            BalanceStrategy::Random => {
                let i = rand::rng().random_range(0..healthy.len());
                healthy[i].clone()
            }
        };

        Ok(picked)
    }

    /// Called when a request to `name` starts.
    pub fn on_request_start(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(health) = inner.health.get_mut(name) {
            health.active_connections += 1;
            health.total_requests += 1;
        }
    }

    /// Called when a request to `name` succeeds, with its latency.
    pub fn on_request_success(&self, name: &str, latency_ms: f64) {
        let mut inner = self.lock();
        let Some(member) = inner.members.get(name).cloned() else { return };
        let Some(health) = inner.health.get_mut(name) else { return };

        health.active_connections = health.active_connections.saturating_sub(1);
        health.consecutive_successes += 1;
        health.consecutive_failures = 0;
        health.avg_latency_ms =
            LATENCY_EWMA_ALPHA * latency_ms + (1.0 - LATENCY_EWMA_ALPHA) * health.avg_latency_ms;
        health.last_check_ms = Some(epoch_millis());

        if !health.is_healthy && health.consecutive_successes >= member.recovery_threshold {
            health.is_healthy = true;
            tracing::info!(provider = %name, "provider recovered");
        }
    }

    /// Called when a request to `name` fails.
    pub fn on_request_failure(&self, name: &str) {
        let mut inner = self.lock();
        let Some(member) = inner.members.get(name).cloned() else { return };
        let Some(health) = inner.health.get_mut(name) else { return };

        health.active_connections = health.active_connections.saturating_sub(1);
        health.consecutive_failures += 1;
        health.consecutive_successes = 0;
        health.failed_requests += 1;
        health.last_check_ms = Some(epoch_millis());

        if health.is_healthy && health.consecutive_failures >= member.failure_threshold {
            health.is_healthy = false;
            tracing::warn!(provider = %name, "provider marked unhealthy");
        }
    }

    /// Probe every provider that has a health URL with a GET request, feeding
    /// the outcome through the normal success/failure accounting. Providers
    /// without a health URL report their current standing.
    pub async fn probe_all(&self, client: &reqwest::Client) -> HashMap<String, bool> {
        let targets: Vec<(String, Option<String>)> = {
            let inner = self.lock();
            inner
                .order
                .iter()
                .map(|n| (n.clone(), inner.members[n].health_url.clone()))
                .collect()
        };

        let mut results = HashMap::new();
        for (name, url) in targets {
            let Some(url) = url else {
                let healthy = self.health(&name).map(|h| h.is_healthy).unwrap_or(false);
                results.insert(name, healthy);
                continue;
            };

            let started = std::time::Instant::now();
            let outcome = client
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|resp| resp.status().is_success());

            let healthy = match outcome {
                Ok(true) => {
                    self.on_request_success(&name, started.elapsed().as_secs_f64() * 1000.0);
                    true
                }
                Ok(false) | Err(_) => {
                    self.on_request_failure(&name);
                    false
                }
            };
            results.insert(name, healthy);
        }
        results
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn healthy_of(inner: &Inner) -> Vec<&str> {
    inner
        .order
        .iter()
        .filter(|n| inner.health.get(*n).map(|h| h.is_healthy).unwrap_or(false))
        .map(String::as_str)
        .collect()
}
