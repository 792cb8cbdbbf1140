//! End-to-end gateway scenarios against a stubbed upstream.

use gatehouse::{
    ApiGateway, AuthMiddleware, BreakerConfig, CacheConfig, CircuitState, Event, EventBus,
    GatewayConfig, GatewayError, ManualClock, ProviderSpec, RequestOptions, TieredCache,
    TrackingSleeper,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> GatewayConfig {
    GatewayConfig {
        breaker: BreakerConfig {
            failure_threshold: 3,
            success_threshold: 3,
            open_duration: Duration::from_secs(30),
            half_open_probe_limit: 3,
        },
        cache: CacheConfig { min_ttl: Duration::ZERO, ..Default::default() },
        ..Default::default()
    }
}

fn provider(name: &str, server: &MockServer) -> ProviderSpec {
    ProviderSpec::new(name, server.uri())
        .retry_attempts(1)
        .retry_delay(Duration::from_millis(1))
}

#[tokio::test]
async fn cache_hit_short_circuits_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    // Pre-seed the cache under the derived request key.
    let key = TieredCache::request_key("GET", "/x", &BTreeMap::new(), None);
    gw.cache().set(&key, json!({"price": 42}), Some(Duration::from_secs(60)), &[], "default");

    let response = gw.get("/x", RequestOptions::new()).await.unwrap();
    assert!(response.cached);
    assert_eq!(response.data, json!({"price": 42}));

    // The provider was never consulted.
    let stats = gw.get_stats();
    assert_eq!(stats.cache.hits, 1);
    assert!(stats.requests_by_provider.is_empty());
    assert_eq!(gw.balancer().health("p").unwrap().total_requests, 0);

    gw.stop().await;
}

#[tokio::test]
async fn breaker_opens_after_consecutive_upstream_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    for _ in 0..3 {
        let err = gw.get("/y", RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamStatus { status: 500, .. }));
    }
    assert_eq!(gw.breaker("p").unwrap().state(), CircuitState::Open);

    // The fourth call is rejected without any HTTP traffic.
    let err = gw.get("/y", RequestOptions::new()).await.unwrap_err();
    assert!(err.is_circuit_open());

    let stats = gw.get_stats();
    assert_eq!(stats.circuit_breaks, 1);
    assert_eq!(stats.failed_requests, 4);
    assert_eq!(stats.errors_by_type["upstream_status"], 3);
    assert!(!stats.errors_by_type.contains_key("circuit_open"));

    gw.stop().await;
}

#[tokio::test]
async fn half_open_recovery_closes_after_success_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/z"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::new());
    let gw = ApiGateway::new(test_config())
        .unwrap()
        .breaker_clock(clock.clone());
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    for _ in 0..3 {
        gw.get("/z", RequestOptions::new().skip_cache()).await.unwrap_err();
    }
    assert_eq!(gw.breaker("p").unwrap().state(), CircuitState::Open);

    clock.advance(30_000);

    // First probe succeeds but one success is below the close threshold.
    gw.get("/z", RequestOptions::new().skip_cache()).await.unwrap();
    assert_eq!(gw.breaker("p").unwrap().state(), CircuitState::HalfOpen);

    gw.get("/z", RequestOptions::new().skip_cache()).await.unwrap();
    gw.get("/z", RequestOptions::new().skip_cache()).await.unwrap();
    assert_eq!(gw.breaker("p").unwrap().state(), CircuitState::Closed);

    gw.stop().await;
}

#[tokio::test]
async fn retries_same_provider_with_exponential_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let sleeper = Arc::new(TrackingSleeper::new());
    let gw = ApiGateway::new(test_config()).unwrap().sleeper(sleeper.clone());
    gw.register_provider(
        ProviderSpec::new("p", server.uri())
            .retry_attempts(3)
            .retry_delay(Duration::from_secs(1)),
    )
    .unwrap();
    gw.start().unwrap();

    let err = gw.get("/flaky", RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamStatus { status: 503, .. }));

    // Two sleeps between three attempts: base, then doubled.
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    assert_eq!(gw.balancer().health("p").unwrap().total_requests, 3);

    gw.stop().await;
}

#[tokio::test]
async fn transient_failure_recovers_within_the_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sometimes"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sometimes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 7})))
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config())
        .unwrap()
        .sleeper(Arc::new(TrackingSleeper::new()));
    gw.register_provider(
        ProviderSpec::new("p", server.uri())
            .retry_attempts(3)
            .retry_delay(Duration::from_millis(1)),
    )
    .unwrap();
    gw.start().unwrap();

    let response = gw.get("/sometimes", RequestOptions::new()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.data, json!({"n": 7}));
    assert!(!response.cached);

    let stats = gw.get_stats();
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.requests_by_provider["p"], 1);

    gw.stop().await;
}

#[tokio::test]
async fn successful_get_fills_the_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sol": 100})))
        .expect(1)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    let first = gw.get("/tokens", RequestOptions::new()).await.unwrap();
    assert!(!first.cached);

    let second = gw.get("/tokens", RequestOptions::new()).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.data, json!({"sol": 100}));

    let stats = gw.get_stats();
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.cache.misses, 1);

    gw.stop().await;
}

#[tokio::test]
async fn skip_cache_always_reaches_the_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(1)))
        .expect(2)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    gw.get("/fresh", RequestOptions::new().skip_cache()).await.unwrap();
    let second = gw.get("/fresh", RequestOptions::new().skip_cache()).await.unwrap();
    assert!(!second.cached);

    gw.stop().await;
}

#[tokio::test]
async fn request_carries_params_api_key_and_static_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "sol"))
        .and(header("Authorization", "Bearer k123"))
        .and(header("X-Env", "prod"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(
        ProviderSpec::new("p", server.uri())
            .api_key("k123")
            .header("X-Env", "prod")
            .retry_attempts(1),
    )
    .unwrap();
    gw.start().unwrap();

    let response = gw
        .get("/search", RequestOptions::new().param("q", "sol"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    gw.stop().await;
}

#[tokio::test]
async fn post_forwards_the_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_json(json!({"side": "buy", "qty": 3})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "o1"})))
        .expect(1)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    let response = gw
        .post("/orders", json!({"side": "buy", "qty": 3}), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.data, json!({"id": "o1"}));

    gw.stop().await;
}

#[tokio::test]
async fn per_provider_timeout_is_authoritative() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(
        ProviderSpec::new("p", server.uri())
            .timeout(Duration::from_millis(50))
            .retry_attempts(1),
    )
    .unwrap();
    gw.start().unwrap();

    let err = gw.get("/slow", RequestOptions::new()).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(gw.get_stats().errors_by_type["timeout"], 1);

    gw.stop().await;
}

#[tokio::test]
async fn unknown_and_disabled_providers_are_rejected() {
    let server = MockServer::start().await;
    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("off", &server).enabled(false)).unwrap();
    gw.start().unwrap();

    let err = gw
        .get("/x", RequestOptions::new().provider("nope"))
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::UnknownProvider("nope".into()));

    let err = gw
        .get("/x", RequestOptions::new().provider("off"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_config");

    gw.stop().await;
}

#[tokio::test]
async fn middleware_abort_prevents_the_outbound_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/trade"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    // No skip paths: every request must carry a principal.
    gw.add_middleware(Arc::new(AuthMiddleware::new().skip_paths(Vec::<String>::new())));
    gw.start().unwrap();

    let err = gw
        .post("/api/trade", json!({}), RequestOptions::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::AbortedByMiddleware { status: 401, message: "authentication required".into() }
    );

    // A request with a principal passes the same pipeline.
    Mock::given(method("GET"))
        .and(path("/open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    let response = gw
        .get("/open", RequestOptions::new().user_id("u1"))
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    gw.stop().await;
}

#[tokio::test]
async fn cached_responses_bypass_the_pipeline() {
    let server = MockServer::start().await;
    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.add_middleware(Arc::new(AuthMiddleware::new().skip_paths(Vec::<String>::new())));
    gw.start().unwrap();

    let key = TieredCache::request_key("GET", "/warm", &BTreeMap::new(), None);
    gw.cache().set(&key, json!("cached"), Some(Duration::from_secs(60)), &[], "default");

    // Anonymous, yet served: the cache lookup runs before the pipeline.
    let response = gw.get("/warm", RequestOptions::new()).await.unwrap();
    assert!(response.cached);

    gw.stop().await;
}

#[tokio::test]
async fn stop_releases_the_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();
    gw.get("/x", RequestOptions::new()).await.unwrap();

    gw.stop().await;
    let err = gw.get("/x", RequestOptions::new()).await.unwrap_err();
    assert_eq!(err, GatewayError::NotStarted);
    assert!(gw.health_check().await.is_err());
}

#[tokio::test]
async fn balancer_spreads_load_when_no_provider_is_pinned() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    for server in [&server_a, &server_b] {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(server)
            .await;
    }

    let gw = ApiGateway::new(GatewayConfig {
        strategy: gatehouse::BalanceStrategy::RoundRobin,
        ..test_config()
    })
    .unwrap();
    gw.register_provider(provider("a", &server_a)).unwrap();
    gw.register_provider(provider("b", &server_b)).unwrap();
    gw.start().unwrap();

    for _ in 0..4 {
        gw.get("/x", RequestOptions::new().skip_cache()).await.unwrap();
    }

    let stats = gw.get_stats();
    assert_eq!(stats.requests_by_provider["a"], 2);
    assert_eq!(stats.requests_by_provider["b"], 2);

    gw.stop().await;
}

#[tokio::test]
async fn gateway_emits_call_events_on_the_bus() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/evented"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let bus = Arc::new(EventBus::default());
    let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe("recorder", &["api.*", "error.occurred"], 0, move |event: Event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok(())
        }
    });

    let gw = ApiGateway::new(test_config()).unwrap().event_bus(bus);
    gw.register_provider(provider("p", &server)).unwrap();
    gw.start().unwrap();

    gw.get("/evented", RequestOptions::new().user_id("u1")).await.unwrap();

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "api.call.started");
    assert_eq!(events[0].user_id.as_deref(), Some("u1"));
    assert_eq!(events[1].event_type, "api.call.completed");
    assert_eq!(events[1].data["status_code"], json!(200));
    assert_eq!(events[1].data["endpoint"], json!("/evented"));
    assert!(events[1].data["duration_ms"].is_number());
    drop(events);

    // A failing call also produces error.occurred.
    let err = gw
        .get("/missing", RequestOptions::new().provider("ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_provider");
    let events = seen.lock().unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(kinds.contains(&"error.occurred"));

    gw.stop().await;
}

#[tokio::test]
async fn health_check_reports_per_provider_results() {
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let broken = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&broken)
        .await;

    let gw = ApiGateway::new(test_config()).unwrap();
    gw.register_provider(
        ProviderSpec::new("good", healthy.uri()).health_url(format!("{}/health", healthy.uri())),
    )
    .unwrap();
    gw.register_provider(
        ProviderSpec::new("bad", broken.uri()).health_url(format!("{}/health", broken.uri())),
    )
    .unwrap();
    gw.register_provider(ProviderSpec::new("unprobed", healthy.uri())).unwrap();
    gw.start().unwrap();

    let report = gw.health_check().await.unwrap();
    assert_eq!(report.total_providers, 3);
    assert_eq!(report.healthy_providers, 2);
    assert!(report.providers["good"]);
    assert!(!report.providers["bad"]);
    assert!(report.providers["unprobed"]);

    gw.stop().await;
}
