use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tinkclaw_sdk::api::{
    ApiClient, ApiClientOptions, ApiError, Confluence, WebhookCondition, WebhookRequest,
};
use tinkclaw_sdk::retry::RetryPolicy;
use tinkclaw_sdk::strategy::{OrderIntent, PositionBook, Strategy, StrategyRunner};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const TEST_API_KEY: &str = "tinkclaw_pro_test";

#[derive(Debug, Clone)]
struct Observed {
    method: Method,
    path: String,
    api_key: Option<String>,
    user_agent: Option<String>,
    query: HashMap<String, String>,
    body: Option<Value>,
}

#[derive(Clone, Default)]
struct HttpState {
    observed: Arc<Mutex<Vec<Observed>>>,
    health_calls: Arc<AtomicUsize>,
}

impl HttpState {
    fn observe(&self, path: &str, headers: &HeaderMap, query: HashMap<String, String>) {
        self.observe_call(Method::GET, path, headers, query, None);
    }

    fn observe_call(
        &self,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        query: HashMap<String, String>,
        body: Option<Value>,
    ) {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        self.observed.lock().unwrap().push(Observed {
            method,
            path: path.to_string(),
            api_key: header("x-api-key"),
            user_agent: header("user-agent"),
            query,
            body,
        });
    }

    fn last(&self, path: &str) -> Observed {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|observed| observed.path == path)
            .cloned()
            .expect("request observed")
    }

    fn hits(&self, path: &str) -> usize {
        self.observed
            .lock()
            .unwrap()
            .iter()
            .filter(|observed| observed.path == path)
            .count()
    }
}

struct MockApi {
    state: HttpState,
    client: ApiClient,
    task: JoinHandle<()>,
}

impl MockApi {
    async fn start() -> Self {
        let state = HttpState::default();
        let app = Router::new()
            .route("/v1/signals", get(signals_handler))
            .route("/v1/confluence", get(confluence_handler))
            .route("/v1/health", get(flaky_health_handler))
            .route("/v1/usage", get(unauthorized_handler))
            .route("/v1/screener", get(rate_limited_handler))
            .route("/v1/market-summary", get(burst_limited_handler))
            .route("/v1/analysis", get(echo_handler))
            .route("/v1/news", get(echo_handler))
            .route("/v1/indices", get(echo_handler))
            .route("/v1/cross-market", get(echo_handler))
            .route("/v1/webhooks", get(list_webhooks_handler))
            .route("/v1/webhooks/subscribe", post(subscribe_webhook_handler))
            .route("/v1/webhooks/{id}", delete(delete_webhook_handler))
            .route("/v1/api-keys/rotate", post(rotate_key_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock api");
        let addr = listener.local_addr().expect("mock api addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock api server");
        });

        let options = ApiClientOptions {
            base_url: Some(format!("http://{addr}/")),
            retry_policy: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
                jitter: Duration::ZERO,
                max_retry_after: Duration::from_secs(1),
            },
            ..ApiClientOptions::default()
        };
        let client = ApiClient::with_options(SecretString::new(TEST_API_KEY.to_string()), options)
            .expect("build api client");
        Self {
            state,
            client,
            task,
        }
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signals_request_carries_key_and_symbols() {
    let api = MockApi::start().await;

    let signals = api
        .client
        .get_signals(&["BTC", "ETH"])
        .await
        .expect("signals should parse");

    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].symbol, "BTC");
    assert_eq!(signals[0].signal, "BUY");
    assert_eq!(signals[0].confidence, Some(82.0));
    assert_eq!(signals[1].signal, "HOLD");
    assert_eq!(signals[1].fields.get("regime"), Some(&json!("ranging")));
    assert_eq!(api.client.calls_remaining(), Some(4999));

    let observed = api.state.observed.lock().unwrap().clone();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].api_key.as_deref(), Some(TEST_API_KEY));
    assert!(observed[0]
        .user_agent
        .as_deref()
        .is_some_and(|agent| agent.starts_with("TinkClaw-Rust/")));
    assert_eq!(observed[0].query.get("symbols").map(String::as_str), Some("BTC,ETH"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_are_retried() {
    let api = MockApi::start().await;

    let health = api.client.health().await.expect("second attempt succeeds");

    assert_eq!(health.get("status"), Some(&json!("ok")));
    assert_eq!(api.state.hits("/v1/health"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_key_is_not_retried() {
    let api = MockApi::start().await;

    let err = api.client.get_usage().await.expect_err("usage must fail");

    match err {
        ApiError::Unauthorized(message) => assert_eq!(message, "Invalid API key"),
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert_eq!(api.state.hits("/v1/usage"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_quota_is_reported_without_retry() {
    let api = MockApi::start().await;

    let err = api.client.get_screener().await.expect_err("screener must fail");

    assert!(
        matches!(err, ApiError::RateLimited { retry_after: None, .. }),
        "{err:?}"
    );
    assert_eq!(api.state.hits("/v1/screener"), 1);
    assert_eq!(api.client.calls_remaining(), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_with_retry_after_is_retried_once_the_wait_passes() {
    let api = MockApi::start().await;

    let summary = api
        .client
        .get_market_summary()
        .await
        .expect("second attempt succeeds");

    assert_eq!(summary.get("regime"), Some(&json!("risk_on")));
    assert_eq!(api.state.hits("/v1/market-summary"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_symbol_lookups_switch_query_parameter() {
    let api = MockApi::start().await;

    api.client
        .get_confluence_many(&["BTC", "ETH"])
        .await
        .expect("multi confluence");
    let multi = api.state.last("/v1/confluence");
    assert_eq!(multi.query.get("symbols").map(String::as_str), Some("BTC,ETH"));
    assert!(!multi.query.contains_key("symbol"));

    api.client.get_confluence_many(&[]).await.expect("default confluence");
    let default = api.state.last("/v1/confluence");
    assert_eq!(default.query.get("symbol").map(String::as_str), Some("BTC"));
    assert!(!default.query.contains_key("symbols"));

    api.client.get_analysis("SOL").await.expect("single analysis");
    let single = api.state.last("/v1/analysis");
    assert_eq!(single.query.get("symbol").map(String::as_str), Some("SOL"));

    api.client
        .get_analysis_many(&["SOL", "AVAX", "DOT"])
        .await
        .expect("multi analysis");
    let many = api.state.last("/v1/analysis");
    assert_eq!(many.query.get("symbols").map(String::as_str), Some("SOL,AVAX,DOT"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn market_context_endpoints() {
    let api = MockApi::start().await;

    let news = api.client.get_news(Some("ETH")).await.expect("news");
    assert_eq!(news["query"]["symbol"], json!("ETH"));
    api.client.get_news(None).await.expect("all news");
    assert!(api.state.last("/v1/news").query.is_empty());

    api.client.get_indices().await.expect("indices");
    assert_eq!(api.state.hits("/v1/indices"), 1);

    let cross = api.client.get_cross_market("SOL").await.expect("cross market");
    assert_eq!(cross["path"], json!("/v1/cross-market"));
    assert_eq!(cross["query"]["symbol"], json!("SOL"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_lifecycle() {
    let api = MockApi::start().await;

    let request = WebhookRequest::new(
        "https://hooks.example.com/tinkclaw",
        "BTC",
        WebhookCondition::RsiLte,
    )
    .with_threshold(30.0);
    let created = api
        .client
        .subscribe_webhook(&request)
        .await
        .expect("subscribe");
    assert_eq!(created["id"], json!("wh 1/a"));

    let subscribe = api.state.last("/v1/webhooks/subscribe");
    assert_eq!(subscribe.method, Method::POST);
    assert_eq!(subscribe.api_key.as_deref(), Some(TEST_API_KEY));
    assert_eq!(
        subscribe.body,
        Some(json!({
            "url": "https://hooks.example.com/tinkclaw",
            "symbol": "BTC",
            "condition": "rsi_lte",
            "threshold": 30.0
        }))
    );

    let hooks = api.client.list_webhooks().await.expect("list");
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0]["condition"], json!("rsi_lte"));

    let deleted = api.client.delete_webhook("wh 1/a").await.expect("delete");
    assert_eq!(deleted["deleted"], json!("wh 1/a"));
    assert_eq!(api.state.last("/v1/webhooks/{id}").method, Method::DELETE);

    let err = api
        .client
        .delete_webhook("  ")
        .await
        .expect_err("blank id is rejected locally");
    assert!(matches!(err, ApiError::InvalidRequest(_)), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_rotation_is_sent_once_and_switches_keys() {
    let api = MockApi::start().await;

    let err = api
        .client
        .rotate_key()
        .await
        .expect_err("first rotation hits a 503");
    assert!(
        matches!(err, ApiError::HttpStatus { status, .. } if status.as_u16() == 503),
        "{err:?}"
    );
    assert_eq!(api.state.hits("/v1/api-keys/rotate"), 1);

    let rotation = api.client.rotate_key().await.expect("rotation");
    assert_eq!(api.state.hits("/v1/api-keys/rotate"), 2);
    assert_eq!(api.state.last("/v1/api-keys/rotate").method, Method::POST);
    let new_key = rotation.new_api_key().expect("new key issued");
    assert_eq!(new_key.expose_secret(), "tinkclaw_pro_rotated");

    let rotated = api.client.with_api_key(new_key);
    rotated.get_indices().await.expect("indices with new key");
    assert_eq!(
        api.state.last("/v1/indices").api_key.as_deref(),
        Some("tinkclaw_pro_rotated")
    );
}

struct BuyStrong;

impl Strategy for BuyStrong {
    fn on_signal(
        &mut self,
        symbol: &str,
        confluence: &Confluence,
        positions: &PositionBook,
    ) -> Vec<OrderIntent> {
        if confluence.score.unwrap_or_default() > 75.0 && positions.get(symbol) == 0.0 {
            vec![OrderIntent::buy(symbol, 1.0)]
        } else {
            Vec::new()
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strategy_runner_polls_confluence_through_the_api() {
    let api = MockApi::start().await;
    let mut runner = StrategyRunner::new(["BTC", "DOGE"], api.client.clone(), BuyStrong);

    let summary = runner.run(Duration::from_millis(10), Some(2)).await;

    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.signals, 4);
    assert_eq!(summary.orders, 1);
    assert_eq!(runner.positions().get("BTC"), 1.0);
    assert_eq!(runner.positions().get("DOGE"), 0.0);
    assert_eq!(runner.history()[0].setup_type.as_deref(), Some("breakout"));
    assert_eq!(api.state.hits("/v1/confluence"), 4);
}

async fn signals_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.observe("/v1/signals", &headers, query);
    (
        [("x-ratelimit-remaining", "4999")],
        Json(json!({
            "signals": [
                {"symbol": "BTC", "signal": "BUY", "confidence": 82, "price": 65000.0},
                {"symbol": "ETH", "signal": "HOLD", "confidence": 51, "regime": "ranging"}
            ]
        })),
    )
}

async fn confluence_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let symbol = query.get("symbol").cloned().unwrap_or_default();
    state.observe("/v1/confluence", &headers, query);
    let (score, signal) = if symbol == "BTC" {
        (81.5, "BUY")
    } else {
        (42.0, "HOLD")
    };
    Json(json!({
        "symbol": symbol,
        "score": score,
        "signal": signal,
        "setup_type": "breakout",
        "layers": {"technical": 70, "sentiment": 55}
    }))
}

async fn flaky_health_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.observe("/v1/health", &headers, query);
    if state.health_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream warming up").into_response();
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn burst_limited_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let earlier = state.hits("/v1/market-summary");
    state.observe("/v1/market-summary", &headers, query);
    if earlier == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "0")],
            Json(json!({"error": "Too many requests"})),
        )
            .into_response();
    }
    Json(json!({"regime": "risk_on"})).into_response()
}

async fn echo_handler(
    State(state): State<HttpState>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let path = uri.path().to_string();
    state.observe(&path, &headers, query.clone());
    Json(json!({"path": path, "query": query}))
}

async fn subscribe_webhook_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.observe_call(
        Method::POST,
        "/v1/webhooks/subscribe",
        &headers,
        HashMap::new(),
        Some(body),
    );
    Json(json!({"id": "wh 1/a", "status": "active"}))
}

async fn list_webhooks_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.observe("/v1/webhooks", &headers, query);
    Json(json!({
        "webhooks": [
            {"id": "wh 1/a", "symbol": "BTC", "condition": "rsi_lte", "threshold": 30.0}
        ]
    }))
}

async fn delete_webhook_handler(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.observe_call(
        Method::DELETE,
        "/v1/webhooks/{id}",
        &headers,
        HashMap::new(),
        None,
    );
    Json(json!({"deleted": id}))
}

async fn rotate_key_handler(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let earlier = state.hits("/v1/api-keys/rotate");
    state.observe_call(
        Method::POST,
        "/v1/api-keys/rotate",
        &headers,
        HashMap::new(),
        None,
    );
    if earlier == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, "rotation backend busy").into_response();
    }
    Json(json!({"api_key": "tinkclaw_pro_rotated", "old_key_valid_hours": 24})).into_response()
}

async fn unauthorized_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.observe("/v1/usage", &headers, query);
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Invalid API key"})),
    )
}

async fn rate_limited_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    state.observe("/v1/screener", &headers, query);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("x-ratelimit-remaining", "0")],
        Json(json!({"error": "Daily limit reached"})),
    )
}
