//! Stream connection manager.
//!
//! `StreamClient` owns the websocket lifecycle: connect, authenticate,
//! subscribe, listen, and reconnect with exponential backoff until stopped.
//! Inbound frames are handed to the [`Dispatcher`] on the listening task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::{with_timeout, ReconnectBackoff};
use crate::stream::dispatch::Dispatcher;
use crate::stream::handlers::{invoke, CallbackRegistry, Category};
use crate::stream::proto::{ClientMessage, ServerMessage};
use crate::stream::subscription::{Subscription, SubscriptionState};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Production websocket endpoint for the stream service.
pub const STREAM_ENDPOINT: &str = "wss://stream.tinkclaw.com";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
    pub const PING_INTERVAL: Duration = Duration::from_secs(30);
    pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Connection and reconnect settings.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Websocket endpoint; [`STREAM_ENDPOINT`] when unset.
    pub endpoint: Option<String>,
    /// Whether to reconnect after a connectivity failure.
    pub reconnect: bool,
    /// First reconnect delay, restored after every successful authentication.
    pub min_backoff: Duration,
    /// Upper bound for reconnect delay growth.
    pub max_backoff: Duration,
    /// Interval between websocket pings while listening.
    pub ping_interval: Duration,
    /// How long to wait for any inbound frame after a ping.
    pub ping_timeout: Duration,
    /// Bound on connecting and on waiting for the auth and subscribe replies.
    pub reply_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            reconnect: true,
            min_backoff: StreamDefaults::MIN_BACKOFF,
            max_backoff: StreamDefaults::MAX_BACKOFF,
            ping_interval: StreamDefaults::PING_INTERVAL,
            ping_timeout: StreamDefaults::PING_TIMEOUT,
            reply_timeout: StreamDefaults::REPLY_TIMEOUT,
        }
    }
}

/// Short-lived stream token and the endpoint it is valid for.
#[derive(Clone, Debug)]
pub struct StreamCredentials {
    pub token: SecretString,
    pub endpoint: Option<String>,
}

/// Source of stream credentials, typically an authenticated REST exchange.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn stream_credentials(&self) -> Result<StreamCredentials, StreamClientError>;
}

/// Provider handing out fixed credentials.
#[derive(Clone, Debug)]
pub struct StaticTokenProvider {
    credentials: StreamCredentials,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self {
            credentials: StreamCredentials {
                token,
                endpoint: None,
            },
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.credentials.endpoint = Some(endpoint.into());
        self
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn stream_credentials(&self) -> Result<StreamCredentials, StreamClientError> {
        Ok(self.credentials.clone())
    }
}

/// Lifecycle phase of a [`StreamClient`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Subscribing,
    Listening,
    Disconnected,
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The server rejected the stream token. Never retried.
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    /// Unexpected reply or frame sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The server closed the connection.
    #[error("connection closed: {0}")]
    Closed(String),

    /// `start` was already called on this client.
    #[error("stream client was already started")]
    AlreadyStarted,

    /// The background worker could not be created.
    #[error("stream runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// The background worker panicked.
    #[error("stream worker panicked")]
    WorkerPanicked,

    /// Credentials could not be obtained.
    #[error("token provider error: {0}")]
    TokenProvider(String),
}

impl StreamClientError {
    /// Whether the error must end the stream instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Realtime stream client.
///
/// Clones share subscription, callbacks, stop signal, and state, so a clone
/// can be used to [`stop`](Self::stop) or resubscribe a running stream.
#[derive(Clone)]
pub struct StreamClient {
    token: SecretString,
    config: StreamConfig,
    subscription: SubscriptionState,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    started: Arc<AtomicBool>,
    state: Arc<RwLock<ConnectionState>>,
}

impl StreamClient {
    /// Creates a stream client for the production endpoint.
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            config: StreamConfig::default(),
            subscription: SubscriptionState::default(),
            dispatcher: Dispatcher::default(),
            shutdown: CancellationToken::new(),
            started: Arc::new(AtomicBool::new(false)),
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
        }
    }

    /// Creates a client from explicit credentials.
    pub fn from_credentials(credentials: StreamCredentials) -> Self {
        let client = Self::new(credentials.token);
        match credentials.endpoint {
            Some(endpoint) => client.with_endpoint(endpoint),
            None => client,
        }
    }

    /// Fetches credentials from `provider` and creates a client.
    pub async fn from_provider<P>(provider: &P) -> Result<Self, StreamClientError>
    where
        P: TokenProvider + ?Sized,
    {
        Ok(Self::from_credentials(provider.stream_credentials().await?))
    }

    /// Sets an explicit stream endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.config.endpoint = Some(endpoint.trim_end().to_string());
        self
    }

    /// Enables or disables automatic reconnects.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn with_min_backoff(mut self, min_backoff: Duration) -> Self {
        self.config.min_backoff = min_backoff;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.config.max_backoff = max_backoff;
        self
    }

    /// Sets the websocket ping interval and liveness timeout.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.ping_interval = interval;
        self.config.ping_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.config.reply_timeout = reply_timeout;
        self
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        self.config.endpoint.as_deref().unwrap_or(STREAM_ENDPOINT)
    }

    /// Sets the symbols and channels to receive.
    ///
    /// Empty `channels` select the default set. While a connection is
    /// listening the change is picked up on the next reconnect.
    pub fn subscribe<S, C>(&self, symbols: S, channels: C) -> &Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        self.subscription.set(Subscription::new(symbols, channels));
        self
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription.snapshot()
    }

    /// Handler registry used for every frame of this stream.
    pub fn callbacks(&self) -> &CallbackRegistry {
        self.dispatcher.callbacks()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Requests shutdown.
    ///
    /// A pending connect, read, or backoff sleep is interrupted and the open
    /// socket, if any, is closed. Calling it more than once has no further
    /// effect.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(event = "stream_stop_requested");
        }
        self.shutdown.cancel();
    }

    /// Runs the stream until [`stop`](Self::stop) is called or authentication
    /// is rejected.
    ///
    /// Every other failure is retried with exponential backoff. A client can
    /// be started once; later calls return [`StreamClientError::AlreadyStarted`].
    pub async fn run(&self) -> Result<(), StreamClientError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StreamClientError::AlreadyStarted);
        }

        let result = self.reconnect_loop().await;
        self.set_state(ConnectionState::Idle);
        info!(event = "stream_stopped", ok = result.is_ok());
        result
    }

    /// Runs the stream on a private current-thread runtime, blocking the
    /// calling thread.
    ///
    /// Must not be called from within an async runtime; use [`run`](Self::run)
    /// or [`spawn`](Self::spawn) there.
    pub fn start_blocking(&self) -> Result<(), StreamClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run())
    }

    /// Runs the stream on a dedicated OS thread and returns its handle.
    pub fn start_background(&self) -> Result<StreamHandle, StreamClientError> {
        let client = self.clone();
        let thread = thread::Builder::new()
            .name("tinkclaw-stream".to_string())
            .spawn(move || client.start_blocking())?;
        Ok(StreamHandle {
            client: self.clone(),
            thread,
        })
    }

    /// Runs the stream as a task on the current tokio runtime.
    pub fn spawn(&self) -> tokio::task::JoinHandle<Result<(), StreamClientError>> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    async fn reconnect_loop(&self) -> Result<(), StreamClientError> {
        let mut backoff = ReconnectBackoff::new(self.config.min_backoff, self.config.max_backoff);

        while !self.shutdown.is_cancelled() {
            let reason = match self.run_session(&mut backoff).await {
                Ok(SessionOutcome::Shutdown) => return Ok(()),
                Ok(SessionOutcome::Ended(reason)) => reason,
                Err(err) if err.is_fatal() => {
                    warn!(event = "stream_auth_rejected", error = %err);
                    self.set_state(ConnectionState::Disconnected);
                    self.notify_disconnect(&err.to_string());
                    return Err(err);
                }
                Err(err) => err.to_string(),
            };

            self.set_state(ConnectionState::Disconnected);
            warn!(event = "stream_disconnected", reason = %reason);
            self.notify_disconnect(&reason);

            if !self.config.reconnect || self.shutdown.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            info!(
                event = "stream_reconnect_scheduled",
                delay_ms = delay.as_millis() as u64
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(())
    }

    async fn run_session(
        &self,
        backoff: &mut ReconnectBackoff,
    ) -> Result<SessionOutcome, StreamClientError> {
        self.set_state(ConnectionState::Connecting);
        let endpoint = self.endpoint();
        debug!(event = "stream_connecting", endpoint);

        let connect = with_timeout(self.config.reply_timeout, connect_async(endpoint));
        let mut socket = match self.unless_stopped(connect).await {
            None => return Ok(SessionOutcome::Shutdown),
            Some(Err(_)) => return Err(StreamClientError::Timeout("connect")),
            Some(Ok(connected)) => connected?.0,
        };

        self.set_state(ConnectionState::Authenticating);
        let auth = ClientMessage::Auth {
            token: self.token.expose_secret().to_string(),
        };
        send_client_message(&mut socket, &auth).await?;

        let reply = match self
            .unless_stopped(self.recv_reply(&mut socket, "auth reply"))
            .await
        {
            Some(reply) => reply?,
            None => {
                let _ = socket.close(None).await;
                return Ok(SessionOutcome::Shutdown);
            }
        };
        match ServerMessage::from_text(&reply)? {
            ServerMessage::AuthOk(info) => {
                info!(
                    event = "stream_authenticated",
                    plan = info.plan.as_deref().unwrap_or("unknown")
                );
                backoff.reset();
                if let Some(handler) = self.callbacks().connect() {
                    invoke(Category::Connect, &handler, &info);
                }
            }
            ServerMessage::AuthError(error) | ServerMessage::Error(error) => {
                let _ = socket.close(None).await;
                return Err(StreamClientError::Unauthorized(
                    error
                        .message
                        .unwrap_or_else(|| "authentication failed".to_string()),
                ));
            }
            other => {
                return Err(StreamClientError::Protocol(format!(
                    "unexpected auth reply: {}",
                    other.kind()
                )));
            }
        }

        self.set_state(ConnectionState::Subscribing);
        let subscription = self.subscription.snapshot();
        if subscription.has_symbols() {
            send_client_message(&mut socket, &subscription.to_message()).await?;
            let reply = self.recv_reply(&mut socket, "subscribe reply");
            match self.unless_stopped(reply).await {
                None => return Ok(self.close_for_shutdown(&mut socket).await),
                Some(Ok(text)) => {
                    let acknowledged = serde_json::from_str::<Value>(&text)
                        .ok()
                        .and_then(|value| value.get("symbols").cloned());
                    info!(event = "stream_subscribed", symbols = ?acknowledged);
                }
                Some(Err(err)) => {
                    warn!(event = "stream_subscribe_unacknowledged", error = %err);
                }
            }
        } else {
            debug!(event = "stream_subscribe_skipped");
        }

        self.set_state(ConnectionState::Listening);
        self.listen(&mut socket).await
    }

    async fn listen(&self, socket: &mut WsStream) -> Result<SessionOutcome, StreamClientError> {
        let ping_interval = self.config.ping_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping_sent_at: Option<Instant> = None;

        loop {
            let liveness_deadline = ping_sent_at.map(|sent| sent + self.config.ping_timeout);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(self.close_for_shutdown(socket).await);
                }
                _ = heartbeat.tick() => {
                    if ping_sent_at.is_none() {
                        socket.send(Message::Ping(Vec::new())).await?;
                        ping_sent_at = Some(Instant::now());
                    }
                }
                _ = sleep_until_deadline(liveness_deadline) => {
                    return Err(StreamClientError::Timeout("heartbeat"));
                }
                maybe_inbound = socket.next() => {
                    ping_sent_at = None;
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatcher.dispatch(&text);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            socket.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|frame| format!("{} {}", frame.code, frame.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                            return Ok(SessionOutcome::Ended(reason));
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!(event = "stream_frame_malformed", kind = "binary");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(StreamClientError::WebSocket(err)),
                        None => return Ok(SessionOutcome::Ended("stream ended".to_string())),
                    }
                }
            }
        }
    }

    /// Waits for the next text frame of a handshake step.
    async fn recv_reply(
        &self,
        socket: &mut WsStream,
        stage: &'static str,
    ) -> Result<String, StreamClientError> {
        with_timeout(self.config.reply_timeout, recv_text(socket, stage))
            .await
            .map_err(|_| StreamClientError::Timeout(stage))?
    }

    async fn unless_stopped<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            output = future => Some(output),
        }
    }

    async fn close_for_shutdown(&self, socket: &mut WsStream) -> SessionOutcome {
        let _ = with_timeout(self.config.reply_timeout, socket.close(None)).await;
        self.set_state(ConnectionState::Disconnected);
        self.notify_disconnect("stream stopped by client");
        SessionOutcome::Shutdown
    }

    fn notify_disconnect(&self, reason: &str) {
        if let Some(handler) = self.callbacks().disconnect() {
            invoke(Category::Disconnect, &handler, reason);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(event = "stream_state", from = ?*state, to = ?next);
            *state = next;
        }
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint())
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Handle to a stream running on its own thread.
#[derive(Debug)]
pub struct StreamHandle {
    client: StreamClient,
    thread: thread::JoinHandle<Result<(), StreamClientError>>,
}

impl StreamHandle {
    /// Client driving the background stream.
    pub fn client(&self) -> &StreamClient {
        &self.client
    }

    pub fn stop(&self) {
        self.client.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Blocks until the stream thread exits and returns its result.
    pub fn join(self) -> Result<(), StreamClientError> {
        self.thread
            .join()
            .map_err(|_| StreamClientError::WorkerPanicked)?
    }
}

enum SessionOutcome {
    /// `stop` was requested.
    Shutdown,
    /// The connection ended for a retryable reason.
    Ended(String),
}

async fn recv_text(
    socket: &mut WsStream,
    stage: &'static str,
) -> Result<String, StreamClientError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(StreamClientError::Closed(format!("socket closed before {stage}")));
            }
            Some(Ok(_)) => {
                return Err(StreamClientError::Protocol(format!(
                    "received non-text frame before {stage}"
                )));
            }
            Some(Err(err)) => return Err(StreamClientError::WebSocket(err)),
            None => {
                return Err(StreamClientError::Closed(format!("socket ended before {stage}")));
            }
        }
    }
}

async fn send_client_message(
    socket: &mut WsStream,
    message: &ClientMessage,
) -> Result<(), StreamClientError> {
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
