use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryDecision, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const API_BASE_URL: &str = "https://api.tinkclaw.com";
/// Symbol queried when a single-symbol endpoint is given none.
pub const DEFAULT_SYMBOL: &str = "BTC";
pub const USER_AGENT: &str = concat!("TinkClaw-Rust/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const JITTER: Duration = Duration::from_millis(100);
    pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(5);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub base_url: Option<String>,
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: ApiDefaults::MAX_ATTEMPTS,
                initial_backoff: ApiDefaults::BACKOFF,
                max_backoff: ApiDefaults::MAX_BACKOFF,
                jitter: ApiDefaults::JITTER,
                max_retry_after: ApiDefaults::MAX_RETRY_AFTER,
            },
        }
    }
}

/// Client for the TinkClaw REST API.
///
/// Every request carries the api key in `x-api-key`. The remaining daily
/// quota reported by the server is tracked across clones.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    api_key: SecretString,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    calls_remaining: Arc<RwLock<Option<u64>>>,
}

impl ApiClient {
    pub fn new(api_key: SecretString) -> Result<Self, ApiError> {
        Self::with_options(api_key, ApiClientOptions::default())
    }

    pub fn with_options(api_key: SecretString, options: ApiClientOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        let base_url = options
            .base_url
            .as_deref()
            .unwrap_or(API_BASE_URL)
            .trim_end()
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            http,
            api_key,
            base_url,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            calls_remaining: Arc::new(RwLock::new(None)),
        })
    }

    /// Same client and quota tracking, authenticating with another key.
    /// Used after `rotate_key`.
    pub fn with_api_key(&self, api_key: SecretString) -> Self {
        Self {
            api_key,
            ..self.clone()
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Remaining API calls for today, as of the last response that reported it.
    pub fn calls_remaining(&self) -> Option<u64> {
        *self
            .calls_remaining
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// BUY/SELL/HOLD signals for `symbols`, or the server default set when empty.
    pub async fn get_signals(&self, symbols: &[&str]) -> Result<Vec<SignalSnapshot>, ApiError> {
        let envelope: SignalsEnvelope<SignalSnapshot> =
            self.get("/v1/signals", &symbols_query(symbols)).await?;
        Ok(envelope.signals)
    }

    /// ML-enhanced signals (baseline plus model output).
    pub async fn get_signals_ml(&self, symbols: &[&str]) -> Result<Vec<Value>, ApiError> {
        let envelope: SignalsEnvelope<Value> =
            self.get("/v1/signals-ml", &symbols_query(symbols)).await?;
        Ok(envelope.signals)
    }

    /// Trend, support/resistance, and recommendation for one symbol.
    pub async fn get_analysis(&self, symbol: &str) -> Result<Value, ApiError> {
        self.get("/v1/analysis", &symbol_selector(&[symbol])).await
    }

    /// Analysis for several symbols in one call. With zero or one symbol the
    /// server returns a flat object, otherwise a keyed collection.
    pub async fn get_analysis_many(&self, symbols: &[&str]) -> Result<Value, ApiError> {
        self.get("/v1/analysis", &symbol_selector(symbols)).await
    }

    /// Multi-layer confluence score for one symbol.
    pub async fn get_confluence(&self, symbol: &str) -> Result<Confluence, ApiError> {
        self.get("/v1/confluence", &symbol_selector(&[symbol])).await
    }

    /// Confluence for several symbols; same selection rules as
    /// [`ApiClient::get_analysis_many`].
    pub async fn get_confluence_many(&self, symbols: &[&str]) -> Result<Value, ApiError> {
        self.get("/v1/confluence", &symbol_selector(symbols)).await
    }

    /// Technical indicators over a lookback of `range_days` (7/30/90/365).
    pub async fn get_indicators(&self, symbol: &str, range_days: u32) -> Result<Value, ApiError> {
        self.get(
            "/v1/indicators",
            &[
                ("symbols", symbol.to_string()),
                ("range", range_days.to_string()),
            ],
        )
        .await
    }

    pub async fn get_risk_metrics(&self, symbols: &[&str]) -> Result<Value, ApiError> {
        self.get("/v1/risk-metrics", &symbols_query(symbols)).await
    }

    pub async fn get_correlation(&self, symbols: &[&str]) -> Result<Value, ApiError> {
        self.get("/v1/correlation", &symbols_query(symbols)).await
    }

    pub async fn get_screener(&self) -> Result<Value, ApiError> {
        self.get("/v1/screener", &[]).await
    }

    /// How `symbol` moves against other asset classes.
    pub async fn get_cross_market(&self, symbol: &str) -> Result<Value, ApiError> {
        self.get("/v1/cross-market", &[("symbol", symbol.to_string())])
            .await
    }

    /// Runs a server-side backtest of a built-in strategy.
    pub async fn backtest(
        &self,
        symbol: &str,
        strategy: &str,
        days: u32,
    ) -> Result<BacktestReport, ApiError> {
        self.get(
            "/v1/backtest",
            &[
                ("symbol", symbol.to_string()),
                ("strategy", strategy.to_string()),
                ("days", days.to_string()),
            ],
        )
        .await
    }

    pub async fn get_market_summary(&self) -> Result<Value, ApiError> {
        self.get("/v1/market-summary", &[]).await
    }

    /// Latest headlines, optionally filtered to one symbol.
    pub async fn get_news(&self, symbol: Option<&str>) -> Result<Value, ApiError> {
        let query: Vec<(&str, String)> = symbol
            .map(|symbol| ("symbol", symbol.to_string()))
            .into_iter()
            .collect();
        self.get("/v1/news", &query).await
    }

    pub async fn get_indices(&self) -> Result<Value, ApiError> {
        self.get("/v1/indices", &[]).await
    }

    pub async fn get_symbols(&self) -> Result<Value, ApiError> {
        self.get("/v1/symbols", &[]).await
    }

    /// Registers `request.url` to be called when the condition triggers.
    pub async fn subscribe_webhook(&self, request: &WebhookRequest) -> Result<Value, ApiError> {
        let body =
            serde_json::to_value(request).map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
        self.call(
            Method::POST,
            self.endpoint("/v1/webhooks/subscribe"),
            &[],
            Some(&body),
        )
        .await
    }

    /// Active webhook subscriptions of this key.
    pub async fn list_webhooks(&self) -> Result<Vec<Value>, ApiError> {
        let envelope: WebhooksEnvelope = self.get("/v1/webhooks", &[]).await?;
        Ok(envelope.webhooks)
    }

    pub async fn delete_webhook(&self, webhook_id: &str) -> Result<Value, ApiError> {
        if webhook_id.trim().is_empty() {
            return Err(ApiError::InvalidRequest("webhook id is empty".to_string()));
        }
        let mut url = Url::parse(&self.endpoint("/v1/webhooks"))
            .map_err(|err| ApiError::InvalidRequest(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidRequest("base url cannot carry a path".to_string()))?
            .push(webhook_id);
        self.call(Method::DELETE, url.to_string(), &[], None).await
    }

    pub async fn get_usage(&self) -> Result<Value, ApiError> {
        self.get("/v1/usage", &[]).await
    }

    /// Plan, status, usage, and quota of the configured api key.
    pub async fn key_info(&self) -> Result<Value, ApiError> {
        self.get("/v1/api-keys/info", &[]).await
    }

    /// Issues a new key. The old key keeps working for 24 hours; switch with
    /// [`ApiClient::with_api_key`].
    pub async fn rotate_key(&self) -> Result<KeyRotation, ApiError> {
        self.call(Method::POST, self.endpoint("/v1/api-keys/rotate"), &[], None)
            .await
    }

    pub async fn health(&self) -> Result<Value, ApiError> {
        self.get("/v1/health", &[]).await
    }

    async fn get<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        self.call(Method::GET, self.endpoint(path), query, None).await
    }

    /// POSTs are sent once; they are not idempotent on the server.
    async fn call<T>(
        &self,
        method: Method,
        endpoint: String,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let policy = if method == Method::POST {
            self.retry_policy.single_attempt()
        } else {
            self.retry_policy.clone()
        };

        retry_async(
            &policy,
            |attempt| {
                let method = method.clone();
                let endpoint = endpoint.as_str();
                async move {
                    debug!(event = "api_request", method = %method, endpoint, attempt);
                    self.send_attempt(method, endpoint, query, body).await
                }
            },
            ApiError::retry_decision,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_attempt<T>(
        &self,
        method: Method,
        endpoint: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout)
            .header("x-api-key", self.api_key.expose_secret());
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        self.record_rate_limit(response.headers());
        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        let body = response.text().await.map_err(ApiError::Transport)?;

        match status {
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized(summarize_error_body(&body))),
            StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited {
                message: summarize_error_body(&body),
                retry_after,
            }),
            status if !status.is_success() => Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            }),
            _ => serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string())),
        }
    }

    fn record_rate_limit(&self, headers: &HeaderMap) {
        if let Some(remaining) = parse_rate_limit_remaining(headers.get(RATE_LIMIT_REMAINING_HEADER))
        {
            *self
                .calls_remaining
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(remaining);
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignalSnapshot {
    pub symbol: String,
    pub signal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Point-in-time confluence score for one symbol.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Confluence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regime: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BacktestReport {
    #[serde(default)]
    pub trades: Vec<Value>,
    #[serde(default)]
    pub equity_curve: Vec<Value>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Alert trigger for a webhook subscription.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookCondition {
    ConfluenceGte,
    ConfluenceLte,
    RsiGte,
    RsiLte,
    PriceGte,
    PriceLte,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct WebhookRequest {
    pub url: String,
    pub symbol: String,
    pub condition: WebhookCondition,
    pub threshold: Option<f64>,
}

impl WebhookRequest {
    pub fn new(url: impl Into<String>, symbol: impl Into<String>, condition: WebhookCondition) -> Self {
        Self {
            url: url.into(),
            symbol: symbol.into(),
            condition,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// Result of a key rotation. The new key is only reachable as a secret.
#[derive(Clone, Default, Deserialize)]
pub struct KeyRotation {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl KeyRotation {
    pub fn new_api_key(&self) -> Option<SecretString> {
        self.api_key.clone().map(SecretString::new)
    }
}

impl std::fmt::Debug for KeyRotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotation")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("fields", &self.fields)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SignalsEnvelope<T> {
    #[serde(default = "Vec::new")]
    signals: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WebhooksEnvelope {
    #[serde(default)]
    webhooks: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("invalid api key: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Transient transport failures and server errors back off. A 429 is
    /// retried only when the server says how long to wait.
    pub fn retry_decision(&self) -> RetryDecision {
        match self {
            Self::Transport(err) if err.is_timeout() || err.is_connect() => RetryDecision::Backoff,
            Self::HttpStatus { status, .. } if status.is_server_error() => RetryDecision::Backoff,
            Self::RateLimited {
                retry_after: Some(wait),
                ..
            } => RetryDecision::After(*wait),
            _ => RetryDecision::Stop,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_decision() != RetryDecision::Stop
    }
}

fn symbols_query(symbols: &[&str]) -> Vec<(&'static str, String)> {
    if symbols.is_empty() {
        Vec::new()
    } else {
        vec![("symbols", symbols.join(","))]
    }
}

fn symbol_selector(symbols: &[&str]) -> Vec<(&'static str, String)> {
    match symbols {
        [] => vec![("symbol", DEFAULT_SYMBOL.to_string())],
        [symbol] => vec![("symbol", (*symbol).to_string())],
        many => vec![("symbols", many.join(","))],
    }
}

/// Only the delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    value?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
        .map(Duration::from_secs)
}

fn parse_rate_limit_remaining(value: Option<&HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
