use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use gatekeeper::{
    algorithms::{AlgorithmRegistry, LimitParams},
    clock::ManualClock,
    config::FailurePolicy,
    create_app,
    error::{LimiterError, Result},
    handlers::AppState,
    health::HealthChecker,
    store::{MemoryStore, StateStore},
    throttler::Throttler,
    whitelist::Whitelist,
};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const START: u64 = 1_700_000_000_000;
const ADMIN_TOKEN: &str = "test-admin-token-0123";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

struct Options {
    algorithm: &'static str,
    params: LimitParams,
    whitelist: Vec<&'static str>,
    expose_headers: bool,
    admin_token: Option<&'static str>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            algorithm: "token-bucket",
            params: LimitParams {
                requests_per_second: 5.0,
                burst_capacity: 10,
                ..LimitParams::default()
            },
            whitelist: Vec::new(),
            expose_headers: true,
            admin_token: Some(ADMIN_TOKEN),
        }
    }
}

fn test_app(options: Options) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(START));
    let algorithm =
        AlgorithmRegistry::with_builtin().select(options.algorithm, store.clone(), options.params);

    let health = HealthChecker::new(store.clone(), "memory", algorithm.name(), Duration::from_millis(100));
    let throttler = Throttler::new(algorithm, store.clone())
        .with_clock(clock.clone())
        .with_whitelist(Whitelist::new(options.whitelist))
        .with_store_timeout(Duration::from_secs(1))
        .with_expose_headers(options.expose_headers);

    TestApp {
        router: create_app(AppState::new(
            throttler,
            health,
            options.admin_token.map(str::to_string),
        )),
        store,
        clock,
    }
}

fn failing_app(policy: FailurePolicy) -> Router {
    let store: Arc<dyn StateStore> = Arc::new(UnreachableStore);
    let algorithm =
        AlgorithmRegistry::with_builtin().select("sliding-window", store.clone(), LimitParams::default());
    let health = HealthChecker::new(store.clone(), "redis", algorithm.name(), Duration::from_millis(100));
    let throttler = Throttler::new(algorithm, store)
        .with_clock(Arc::new(ManualClock::new(START)))
        .with_failure_policy(policy);
    create_app(AppState::new(throttler, health, Some(ADMIN_TOKEN.to_string())))
}

fn api_request(api_key: &str) -> Request<Body> {
    Request::builder()
        .uri("/api/orders")
        .header("x-api-key", api_key)
        .body(Body::empty())
        .unwrap()
}

fn admin_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> axum::response::Response {
    router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

struct UnreachableStore;

#[async_trait]
impl StateStore for UnreachableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(LimiterError::Store("connection refused".to_string()))
    }

    async fn set_if_not_exists(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<bool> {
        Err(LimiterError::Store("connection refused".to_string()))
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: &str,
        _new_value: &str,
        _ttl: Duration,
    ) -> Result<bool> {
        Err(LimiterError::Store("connection refused".to_string()))
    }

    async fn atomic_increment(&self, _key: &str, _delta: i64, _ttl: Duration) -> Result<i64> {
        Err(LimiterError::Store("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(LimiterError::Store("connection refused".to_string()))
    }

    async fn ping(&self) -> Result<()> {
        Err(LimiterError::Store("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_admitted_request_carries_quota_headers() {
    let app = test_app(Options::default());

    let response = send(&app.router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["x-ratelimit-limit"], "10");
    assert_eq!(headers["x-ratelimit-remaining"], "9");
    assert_eq!(headers["x-ratelimit-reset"], "1700000001");
    assert!(headers.contains_key("x-request-id"));

    let body = json_body(response).await;
    assert_eq!(body["status"], "forwarded");
}

#[tokio::test]
async fn test_headers_can_be_suppressed() {
    let app = test_app(Options {
        expose_headers: false,
        ..Options::default()
    });

    let response = send(&app.router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-ratelimit-limit"));
    assert!(!response.headers().contains_key("x-ratelimit-remaining"));
}

#[tokio::test]
async fn test_exhausted_burst_is_rejected_with_429() {
    let app = test_app(Options::default());

    for _ in 0..10 {
        let response = send(&app.router, api_request("abc")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&app.router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let headers = response.headers();
    assert_eq!(headers["retry-after"], "1");
    assert_eq!(headers["x-ratelimit-limit"], "10");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert!(headers.contains_key("x-ratelimit-reset"));

    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["message"], "Too many requests from api_key:abc: token bucket empty");
    assert_eq!(body["retryAfter"], 1);

    // Another client is unaffected.
    let response = send(&app.router, api_request("other")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_tokens_refill_over_time() {
    let app = test_app(Options::default());

    for _ in 0..10 {
        send(&app.router, api_request("abc")).await;
    }
    assert_eq!(
        send(&app.router, api_request("abc")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    app.clock.advance(Duration::from_millis(200));
    assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app.router, api_request("abc")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_whitelisted_client_is_never_limited() {
    let app = test_app(Options {
        algorithm: "fixed-window",
        params: LimitParams {
            requests_per_second: 1.0,
            window_size: Duration::from_secs(1),
            ..LimitParams::default()
        },
        whitelist: vec!["api_key:internal"],
        ..Options::default()
    });

    for _ in 0..200 {
        let response = send(&app.router, api_request("internal")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-remaining"));
    }
    assert!(app.store.is_empty());
    assert!(!app.store.has_key_containing("internal"));
}

#[tokio::test]
async fn test_anonymous_traffic_shares_unknown_key() {
    let app = test_app(Options {
        params: LimitParams {
            requests_per_second: 1.0,
            burst_capacity: 1,
            ..LimitParams::default()
        },
        ..Options::default()
    });

    let anonymous = || Request::builder().uri("/").body(Body::empty()).unwrap();
    assert_eq!(send(&app.router, anonymous()).await.status(), StatusCode::OK);

    let response = send(&app.router, anonymous()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["message"], "Too many requests from unknown: token bucket empty");
    assert!(app.store.has_key_containing("token_bucket:unknown"));
}

#[tokio::test]
async fn test_fixed_window_end_to_end() {
    let app = test_app(Options {
        algorithm: "fixed-window",
        params: LimitParams {
            requests_per_second: 2.0,
            window_size: Duration::from_secs(5),
            ..LimitParams::default()
        },
        ..Options::default()
    });

    for remaining in (0..10).rev() {
        let response = send(&app.router, api_request("abc")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining.to_string().as_str());
    }

    app.clock.advance(Duration::from_millis(3_000));
    let response = send(&app.router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "2");
    let body = json_body(response).await;
    assert_eq!(body["message"], "Too many requests from api_key:abc: fixed window limit exceeded");

    app.clock.advance(Duration::from_millis(2_000));
    assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_sliding_window_end_to_end() {
    let app = test_app(Options {
        algorithm: "sliding-window",
        params: LimitParams {
            requests_per_second: 1.0,
            window_size: Duration::from_secs(3),
            ..LimitParams::default()
        },
        ..Options::default()
    });

    for _ in 0..3 {
        assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
        app.clock.advance(Duration::from_secs(1));
    }

    let response = send(&app.router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "1");

    app.clock.advance(Duration::from_secs(1));
    assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_leaky_bucket_end_to_end() {
    let app = test_app(Options {
        algorithm: "leaky-bucket",
        params: LimitParams {
            requests_per_second: 2.0,
            burst_capacity: 3,
            window_size: Duration::from_secs(1),
            ..LimitParams::default()
        },
        ..Options::default()
    });

    for _ in 0..3 {
        assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
    }
    let response = send(&app.router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["message"], "Too many requests from api_key:abc: leaky bucket overflow");

    app.clock.advance(Duration::from_secs(1));
    assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_algorithm_falls_back_to_token_bucket() {
    let app = test_app(Options {
        algorithm: "gcra",
        ..Options::default()
    });

    send(&app.router, api_request("abc")).await;
    assert!(app.store.has_key_containing("rate_limit:token_bucket:api_key:abc"));
}

#[tokio::test]
async fn test_fail_open_admits_when_store_is_down() {
    let router = failing_app(FailurePolicy::Open);

    for _ in 0..5 {
        let response = send(&router, api_request("abc")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-remaining"));
    }

    let response = send(&router, admin_request("GET", "/admin/metrics", Some(ADMIN_TOKEN))).await;
    let body = json_body(response).await;
    assert_eq!(body["fail_open_requests"], 5);
}

#[tokio::test]
async fn test_fail_closed_denies_when_store_is_down() {
    let router = failing_app(FailurePolicy::Closed);

    let response = send(&router, api_request("abc")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "1");
    let body = json_body(response).await;
    assert_eq!(body["message"], "Too many requests from api_key:abc: rate limit store unavailable");
}

#[tokio::test]
async fn test_health_reports_degraded_store() {
    let router = failing_app(FailurePolicy::Open);

    let response = send(&router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["dependencies"]["store"]["status"], "unavailable");

    let response = send(&router, Request::get("/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["store"], "disconnected");
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app(Options::default());

    let response = send(&app.router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["algorithm"], "token-bucket");
    assert_eq!(body["dependencies"]["store"]["backend"], "memory");
}

#[tokio::test]
async fn test_admin_routes_are_not_rate_limited() {
    let app = test_app(Options {
        params: LimitParams {
            requests_per_second: 1.0,
            burst_capacity: 1,
            ..LimitParams::default()
        },
        ..Options::default()
    });

    for _ in 0..20 {
        let request = Request::get("/health")
            .header("x-api-key", "abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app.router, request).await.status(), StatusCode::OK);
    }
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn test_reset_endpoint_restores_quota() {
    let app = test_app(Options {
        params: LimitParams {
            requests_per_second: 1.0,
            burst_capacity: 2,
            ..LimitParams::default()
        },
        ..Options::default()
    });

    send(&app.router, api_request("abc")).await;
    send(&app.router, api_request("abc")).await;
    assert_eq!(
        send(&app.router, api_request("abc")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let request = admin_request("DELETE", "/admin/rate-limit/api_key:abc", Some(ADMIN_TOKEN));
    let response = send(&app.router, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["key"], "api_key:abc");

    assert_eq!(send(&app.router, api_request("abc")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_reset_requires_admin_token() {
    let app = test_app(Options {
        params: LimitParams {
            requests_per_second: 1.0,
            burst_capacity: 1,
            ..LimitParams::default()
        },
        ..Options::default()
    });

    send(&app.router, api_request("abc")).await;
    assert_eq!(
        send(&app.router, api_request("abc")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    for token in [None, Some("wrong-admin-token-0123")] {
        let request = admin_request("DELETE", "/admin/rate-limit/api_key:abc", token);
        let response = send(&app.router, request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["error"], "unauthorized");
    }

    // The client's quota is untouched.
    assert_eq!(
        send(&app.router, api_request("abc")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let response = send(&app.router, admin_request("GET", "/admin/metrics", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_routes_disabled_without_configured_token() {
    let app = test_app(Options {
        admin_token: None,
        ..Options::default()
    });

    let request = admin_request("DELETE", "/admin/rate-limit/api_key:abc", Some(ADMIN_TOKEN));
    assert_eq!(send(&app.router, request).await.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app.router, admin_request("GET", "/admin/metrics", Some(ADMIN_TOKEN))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Health stays open.
    let response = send(&app.router, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = test_app(Options {
        params: LimitParams {
            requests_per_second: 1.0,
            burst_capacity: 1,
            ..LimitParams::default()
        },
        whitelist: vec!["api_key:internal"],
        ..Options::default()
    });

    send(&app.router, api_request("abc")).await;
    send(&app.router, api_request("abc")).await;
    send(&app.router, api_request("internal")).await;

    let response = send(&app.router, admin_request("GET", "/admin/metrics", Some(ADMIN_TOKEN))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["algorithm"], "token-bucket");
    assert_eq!(body["total_requests"], 3);
    assert_eq!(body["admitted_requests"], 1);
    assert_eq!(body["throttled_requests"], 1);
    assert_eq!(body["exempt_requests"], 1);
}

/// Same configuration, same state, same clock: same decisions.
#[tokio::test]
async fn test_decisions_are_deterministic_for_every_algorithm() {
    let registry = AlgorithmRegistry::with_builtin();
    let params = LimitParams {
        requests_per_second: 2.0,
        burst_capacity: 4,
        window_size: Duration::from_secs(3),
        ..LimitParams::default()
    };
    let arrivals: Vec<(u64, &str)> = (0..60u64)
        .map(|i| (i * 137 % 400, if i % 3 == 0 { "ip:10.0.0.2" } else { "ip:10.0.0.1" }))
        .collect();

    for name in registry.names() {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
            let algorithm = registry.select(name, store, params.clone());
            let mut now = START;
            let mut decisions = Vec::new();
            for (gap, client) in &arrivals {
                now += gap;
                decisions.push(algorithm.check(client, now).await.unwrap());
            }
            runs.push(decisions);
        }
        assert_eq!(runs[0], runs[1], "{} is not deterministic", name);
        assert!(runs[0].iter().any(|d| d.is_admitted()), "{} admitted nothing", name);
        assert!(runs[0].iter().any(|d| !d.is_admitted()), "{} denied nothing", name);
    }
}
