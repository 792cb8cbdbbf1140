//! Circuit breaker gating admission to a single upstream provider.
//!
//! Transitions are evaluated lazily on access: there is no background timer.
//! An open breaker flips to half-open on the first admission check after the
//! cooldown has elapsed.

use crate::error::GatewayError;
use crate::time::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests flow through.
    Closed,
    /// Failing, requests rejected until the cooldown elapses.
    Open,
    /// Probing recovery with a bounded number of trial requests.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes needed to close from half-open.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_duration: Duration,
    /// Concurrent probe requests allowed while half-open.
    pub half_open_probe_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_duration: Duration::from_secs(30),
            half_open_probe_limit: 3,
        }
    }
}

/// Counters tracked per breaker.
#[derive(Debug, Default, Clone)]
pub struct BreakerStats {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub state_changes: u64,
}

struct Inner {
    state: CircuitState,
    stats: BreakerStats,
    last_transition_ms: u64,
    half_open_in_flight: u32,
}

impl Inner {
    fn fresh(now_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            stats: BreakerStats::default(),
            last_transition_ms: now_ms,
            half_open_in_flight: 0,
        }
    }
}

/// Per-provider circuit breaker.
///
/// One mutex guards the state and every counter, so admission decisions
/// linearize with the success/failure reports that drive transitions.
/// `on_success` and `on_failure` are the only entry points that advance the
/// state machine.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    /// Create a breaker driven by the given clock (deterministic in tests).
    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self { name: name.into(), config, clock, inner: Mutex::new(Inner::fresh(now)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the lazy open-to-half-open transition first.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    /// Snapshot of the breaker counters.
    pub fn stats(&self) -> BreakerStats {
        self.lock().stats.clone()
    }

    /// Milliseconds until an open circuit starts probing again. Zero unless open.
    pub fn remaining_cooldown_ms(&self) -> u64 {
        let inner = self.lock();
        self.remaining_ms(&inner)
    }

    /// Ask whether a request may proceed.
    ///
    /// Admission in half-open atomically takes a probe slot; the matching
    /// release happens in `on_success`/`on_failure`, so every admitted request
    /// must report exactly one outcome.
    pub fn try_admit(&self) -> Result<(), GatewayError> {
        let mut inner = self.lock();
        self.maybe_enter_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.stats.total_requests += 1;
                Ok(())
            }
            CircuitState::Open => Err(GatewayError::CircuitOpen {
                provider: self.name.clone(),
                remaining_ms: self.remaining_ms(&inner),
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_probe_limit {
                    inner.half_open_in_flight += 1;
                    inner.stats.total_requests += 1;
                    Ok(())
                } else {
                    Err(GatewayError::CircuitOpen {
                        provider: self.name.clone(),
                        remaining_ms: 0,
                    })
                }
            }
        }
    }

    /// Report a successful request.
    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.stats.total_successes += 1;
        inner.stats.consecutive_successes += 1;
        inner.stats.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            if inner.stats.consecutive_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    /// Report a failed request.
    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.stats.total_failures += 1;
        inner.stats.consecutive_failures += 1;
        inner.stats.consecutive_successes = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                // Any probe failure reopens immediately.
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                if inner.stats.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Manually open the circuit, restarting the cooldown.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Reset to closed with all counters zeroed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = Inner::fresh(self.clock.now_millis());
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    fn maybe_enter_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            let elapsed = self.clock.now_millis().saturating_sub(inner.last_transition_ms);
            if elapsed >= self.config.open_duration.as_millis() as u64 {
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn remaining_ms(&self, inner: &Inner) -> u64 {
        if inner.state != CircuitState::Open {
            return 0;
        }
        let elapsed = self.clock.now_millis().saturating_sub(inner.last_transition_ms);
        (self.config.open_duration.as_millis() as u64).saturating_sub(elapsed)
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;
        inner.last_transition_ms = self.clock.now_millis();
        inner.stats.state_changes += 1;

        if new_state == CircuitState::HalfOpen {
            inner.half_open_in_flight = 0;
        }
        if new_state == CircuitState::Closed {
            inner.stats.consecutive_failures = 0;
            inner.stats.consecutive_successes = 0;
        }

        match new_state {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                failures = inner.stats.consecutive_failures,
                "circuit breaker {} -> {}", old_state, new_state
            ),
            _ => tracing::info!(
                breaker = %self.name,
                "circuit breaker {} -> {}", old_state, new_state
            ),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of named circuit breakers.
#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose breakers share the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { breakers: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    /// Get the breaker registered under `name`, creating it on first use.
    /// An existing breaker wins; the config is only applied at creation.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut map = self.lock();
        map.entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(name, config, Arc::clone(&self.clock)))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.lock().remove(name)
    }

    /// States of all registered breakers, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.lock();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(name, b)| (name.clone(), b.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn reset_all(&self) {
        for breaker in self.lock().values() {
            breaker.reset();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
