//! Realtime stream modules.
//!
//! - `client`: websocket connection manager with auth, resubscribe, and
//!   reconnect handling.
//! - `dispatch`: inbound frame classification and handler routing.
//! - `handlers`: callback registry, one slot per message category.
//! - `proto`: protocol messages shared with the stream service.
//! - `subscription`: desired symbols and channels.

/// Websocket connection manager.
pub mod client;
/// Frame dispatcher.
pub mod dispatch;
/// Callback registry.
pub mod handlers;
/// Stream protocol messages.
pub mod proto;
/// Subscription state.
pub mod subscription;

pub use client::{
    ConnectionState, StaticTokenProvider, StreamClient, StreamClientError, StreamConfig,
    StreamCredentials, StreamHandle, TokenProvider,
};
pub use handlers::{CallbackRegistry, Category};
pub use subscription::{Subscription, DEFAULT_CHANNELS};
