//! Polling strategy loop over confluence signals.
//!
//! A [`StrategyRunner`] asks a [`SignalSource`] for the confluence of each
//! symbol, hands it to a user [`Strategy`], and routes the returned
//! [`OrderIntent`]s to an [`OrderSink`]. Without a configured sink orders go
//! to [`DryRunSink`], which only logs them.

use std::collections::{BTreeMap, VecDeque};
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{ApiClient, ApiError, Confluence};

/// Signal records kept by a runner unless configured otherwise.
pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order a strategy wants placed.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderIntent {
    pub symbol: String,
    pub size: f64,
    pub side: Side,
    pub reason: Option<String>,
}

impl OrderIntent {
    pub fn buy(symbol: impl Into<String>, size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            size,
            side: Side::Buy,
            reason: None,
        }
    }

    pub fn sell(symbol: impl Into<String>, size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            size,
            side: Side::Sell,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn signed_size(&self) -> f64 {
        match self.side {
            Side::Buy => self.size,
            Side::Sell => -self.size,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderConfirmation {
    pub order_id: String,
    pub symbol: String,
    pub size: f64,
    pub side: Side,
}

#[derive(Debug, Error)]
pub enum OrderSinkError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order backend unavailable: {0}")]
    Unavailable(String),
}

/// Order execution backend.
#[async_trait]
pub trait OrderSink: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, order: &OrderIntent) -> Result<OrderConfirmation, OrderSinkError>;
}

/// Sink that logs orders and confirms them without executing anything.
#[derive(Debug, Default)]
pub struct DryRunSink {
    next_id: AtomicU64,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderSink for DryRunSink {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn submit(&self, order: &OrderIntent) -> Result<OrderConfirmation, OrderSinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            event = "strategy_order_dry_run",
            symbol = %order.symbol,
            side = order.side.as_str(),
            size = order.size,
            reason = order.reason.as_deref().unwrap_or("")
        );
        Ok(OrderConfirmation {
            order_id: format!("dry-run-{id}"),
            symbol: order.symbol.clone(),
            size: order.size,
            side: order.side,
        })
    }
}

/// Where the runner reads confluence from.
#[async_trait]
pub trait SignalSource: Send + Sync {
    type Error: StdError + Send + Sync + 'static;

    async fn confluence(&self, symbol: &str) -> Result<Confluence, Self::Error>;
}

#[async_trait]
impl SignalSource for ApiClient {
    type Error = ApiError;

    async fn confluence(&self, symbol: &str) -> Result<Confluence, ApiError> {
        self.get_confluence(symbol).await
    }
}

/// User trading logic.
pub trait Strategy: Send {
    /// Called once per symbol per iteration with the latest confluence.
    fn on_signal(
        &mut self,
        symbol: &str,
        confluence: &Confluence,
        positions: &PositionBook,
    ) -> Vec<OrderIntent>;
}

/// Net position per symbol; positive is long, negative is short.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PositionBook {
    positions: BTreeMap<String, f64>,
}

impl PositionBook {
    pub fn get(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.positions.iter().map(|(symbol, size)| (symbol.as_str(), *size))
    }

    fn apply(&mut self, confirmation: &OrderConfirmation) {
        let delta = match confirmation.side {
            Side::Buy => confirmation.size,
            Side::Sell => -confirmation.size,
        };
        *self.positions.entry(confirmation.symbol.clone()).or_insert(0.0) += delta;
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SignalRecord {
    pub observed_at_ms: u64,
    pub symbol: String,
    pub score: Option<f64>,
    pub signal: Option<String>,
    pub setup_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("signal source failed: {0}")]
    Source(Box<dyn StdError + Send + Sync>),

    #[error(transparent)]
    Order(#[from] OrderSinkError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: usize,
    pub signals: usize,
    pub orders: usize,
    pub errors: usize,
}

pub struct StrategyRunner<St, Src> {
    symbols: Vec<String>,
    strategy: St,
    source: Src,
    sink: Arc<dyn OrderSink>,
    positions: PositionBook,
    history: VecDeque<SignalRecord>,
    history_limit: usize,
    shutdown: CancellationToken,
}

impl<St, Src> StrategyRunner<St, Src>
where
    St: Strategy,
    Src: SignalSource,
{
    pub fn new<I>(symbols: I, source: Src, strategy: St) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            strategy,
            source,
            sink: Arc::new(DryRunSink::new()),
            positions: PositionBook::default(),
            history: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OrderSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Keeps at most `limit` signal records, dropping the oldest first.
    /// Zero disables the history.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self.trim_history();
        self
    }

    /// Uses `token` to stop [`run`](Self::run) between iterations.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    /// Most recent signal records, oldest first.
    pub fn history(&self) -> &VecDeque<SignalRecord> {
        &self.history
    }

    pub fn strategy(&self) -> &St {
        &self.strategy
    }

    /// Polls every symbol, sleeping `interval` between iterations.
    ///
    /// Runs until `max_iterations` is reached or the shutdown token is
    /// cancelled. A failure for one symbol is logged and does not affect the
    /// others.
    pub async fn run(&mut self, interval: Duration, max_iterations: Option<usize>) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(
            event = "strategy_started",
            symbols = self.symbols.len(),
            sink = self.sink.name(),
            interval_secs = interval.as_secs_f64()
        );

        loop {
            if max_iterations.is_some_and(|max| summary.iterations >= max)
                || self.shutdown.is_cancelled()
            {
                break;
            }

            info!(event = "strategy_iteration", iteration = summary.iterations + 1);
            for index in 0..self.symbols.len() {
                let symbol = self.symbols[index].clone();
                let mut placed = 0;
                let result = self.process_symbol(&symbol, &mut placed).await;
                summary.orders += placed;
                match result {
                    Ok(()) => summary.signals += 1,
                    Err(err) => {
                        summary.errors += 1;
                        error!(event = "strategy_symbol_failed", symbol = %symbol, error = %err);
                    }
                }
            }
            summary.iterations += 1;

            if max_iterations.is_some_and(|max| summary.iterations >= max) {
                break;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(
            event = "strategy_stopped",
            iterations = summary.iterations,
            orders = summary.orders,
            errors = summary.errors
        );
        summary
    }

    /// Runs one symbol through the strategy. `placed` counts confirmed orders,
    /// including those confirmed before a later order fails.
    async fn process_symbol(
        &mut self,
        symbol: &str,
        placed: &mut usize,
    ) -> Result<(), StrategyError> {
        let confluence = self
            .source
            .confluence(symbol)
            .await
            .map_err(|err| StrategyError::Source(Box::new(err)))?;
        self.record(symbol, &confluence);

        let orders = self
            .strategy
            .on_signal(symbol, &confluence, &self.positions);

        for order in orders {
            let confirmation = self.sink.submit(&order).await?;
            info!(
                event = "strategy_order_placed",
                order_id = %confirmation.order_id,
                symbol = %confirmation.symbol,
                side = confirmation.side.as_str(),
                size = order.signed_size()
            );
            self.positions.apply(&confirmation);
            *placed += 1;
        }
        Ok(())
    }

    fn record(&mut self, symbol: &str, confluence: &Confluence) {
        info!(
            event = "strategy_signal",
            symbol,
            score = confluence.score,
            signal = confluence.signal.as_deref().unwrap_or(""),
            setup = confluence.setup_type.as_deref().unwrap_or("")
        );
        if self.history_limit == 0 {
            return;
        }
        self.history.push_back(SignalRecord {
            observed_at_ms: now_ms(),
            symbol: symbol.to_string(),
            score: confluence.score,
            signal: confluence.signal.clone(),
            setup_type: confluence.setup_type.clone(),
        });
        self.trim_history();
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
