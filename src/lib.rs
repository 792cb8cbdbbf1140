#![forbid(unsafe_code)]

//! # Gatehouse
//!
//! A request-mediation fabric that sits between application code and a pool
//! of upstream HTTP providers:
//!
//! - **Circuit breakers** with half-open probing, addressed through a registry
//! - **Multi-level cache** (in-process LRU over SQLite) with TTL clamping,
//!   tag/prefix invalidation, and singleflight loading
//! - **Load balancer** with six strategies and health tracking
//! - **Middleware pipeline** with priority ordering and abort semantics
//! - **Gateway orchestrator** wiring the above around a bounded retry loop
//! - **Event bus** with pattern subscriptions and an optional replayable store
//!
//! ## Quick start
//!
//! ```no_run
//! use gatehouse::{ApiGateway, GatewayConfig, ProviderSpec, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), gatehouse::GatewayError> {
//!     let gateway = ApiGateway::new(GatewayConfig::default())?;
//!     gateway.register_provider(
//!         ProviderSpec::new("dexscreener", "https://api.dexscreener.com/latest")
//!             .cache_ttl(std::time::Duration::from_secs(60)),
//!     )?;
//!     gateway.start()?;
//!
//!     let response = gateway
//!         .get("/dex/tokens/SOL", RequestOptions::new().provider("dexscreener"))
//!         .await?;
//!     println!("status={} cached={}", response.status, response.cached);
//!
//!     gateway.stop().await;
//!     Ok(())
//! }
//! ```

mod balancer;
mod breaker;
mod cache;
mod error;
mod event_store;
mod events;
mod gateway;
mod middleware;
mod provider;
mod time;

// Re-exports
pub use balancer::{BalanceStrategy, LoadBalancer, PoolMember, ProviderHealth};
pub use breaker::{BreakerConfig, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState};
pub use cache::{CacheConfig, CacheStats, NamespaceStats, TieredCache};
pub use error::GatewayError;
pub use event_store::{EventQuery, EventStore};
pub use events::{BusConfig, Event, EventBus, EventType};
pub use gateway::{
    ApiGateway, ApiResponse, CacheCounters, GatewayConfig, HealthReport, ProviderStatus,
    RequestOptions, StatsReport,
};
pub use middleware::{
    standard_pipeline, AuthMiddleware, Context, ErrorMiddleware, Handler, HandlerFuture,
    LoggingMiddleware, MetricsMiddleware, MetricsReport, Middleware, Next, PathMetrics, Pipeline,
    Principal, RateLimitMiddleware, RequestParts, Response,
};
pub use provider::ProviderSpec;
pub use time::{Clock, InstantSleeper, ManualClock, MonotonicClock, Sleeper, TokioSleeper, TrackingSleeper};
