//! User-facing Rust SDK for the TinkClaw signals API and realtime stream.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client for signals, confluence, analysis, and account data.
//! - `stream`: realtime websocket client with typed callbacks and automatic
//!   reconnects.
//! - `strategy`: polling strategy runner and order sink seam.
//! - `retry`: shared retry, backoff, and timeout utilities.

/// Signals API client and response types.
pub mod api;
/// Retry, backoff, and timeout helpers used across the SDK.
pub mod retry;
/// Polling strategy runner.
pub mod strategy;
/// Realtime stream client, protocol types, and callback registry.
pub mod stream;
