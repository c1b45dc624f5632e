//! Desired symbol/channel set, resent after every successful authentication.

use std::sync::{Arc, PoisonError, RwLock};

use crate::stream::proto::ClientMessage;

/// Channels used when a subscription names none.
pub const DEFAULT_CHANNELS: [&str; 3] = ["tick", "candle:60", "signal"];

/// Symbols and channels the caller wants to receive.
///
/// Channel names are not validated; unknown names are sent as-is and simply
/// never match a handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    symbols: Vec<String>,
    channels: Vec<String>,
}

impl Subscription {
    /// Builds a subscription, falling back to [`DEFAULT_CHANNELS`] when
    /// `channels` is empty.
    pub fn new<S, C>(symbols: S, channels: C) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        let mut channels: Vec<String> = channels.into_iter().map(Into::into).collect();
        if channels.is_empty() {
            channels = default_channels();
        }
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
            channels,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Whether a subscribe frame should be sent at all.
    pub fn has_symbols(&self) -> bool {
        !self.symbols.is_empty()
    }

    pub(crate) fn to_message(&self) -> ClientMessage {
        ClientMessage::Subscribe {
            symbols: self.symbols.clone(),
            channels: self.channels.clone(),
        }
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            channels: default_channels(),
        }
    }
}

/// Shared handle to the current [`Subscription`].
///
/// Writers may update it at any time; the stream client takes a snapshot at
/// each subscribe step, so an update made while a connection is listening
/// applies from the next reconnect on.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionState {
    inner: Arc<RwLock<Subscription>>,
}

impl SubscriptionState {
    /// Overwrites both symbols and channels.
    pub fn set(&self, subscription: Subscription) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = subscription;
    }

    pub fn snapshot(&self) -> Subscription {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn default_channels() -> Vec<String> {
    DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect()
}
