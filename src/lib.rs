//! # wsveil
//!
//! A censorship-circumvention transport. The client opens what looks like an
//! ordinary HTTP request, except the request bytes have been mangled by a
//! pluggable Geneva-family strategy so that on-path DPI middleboxes fail to
//! classify the flow. The server repairs the request into well-formed HTTP,
//! completes a WebSocket upgrade, and from then on both endpoints exchange
//! arbitrary binary payloads over what behaves as a plain duplex byte pipe.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Application bytes                      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Cipher overlay (optional AES-OFB, key-gated)           │
//! ├─────────────────────────────────────────────────────────┤
//! │  WebSocket framing (binary messages ⇄ byte stream)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  First-request layer                                     │
//! │    client: strategy-transform the upgrade request        │
//! │    server: normalize it back to valid HTTP               │
//! ├─────────────────────────────────────────────────────────┤
//! │  TCP, optionally under TLS                               │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! The server wraps a TCP listener; accepted connections are post-handshake
//! flows:
//!
//! ```no_run
//! # async fn run() -> wsveil::Result<()> {
//! let listener = wsveil::WsListener::bind("0.0.0.0:8080", wsveil::ListenOpts::default()).await?;
//! let conn = listener.accept().await?;
//! # drop(conn); Ok(()) }
//! ```
//!
//! The client dials with an optional strategy and pre-shared key:
//!
//! ```no_run
//! # async fn run(engine: std::sync::Arc<dyn wsveil::StrategyEngine>) -> wsveil::Result<()> {
//! let opts = wsveil::DialOpts {
//!     strategy: Some("[HTTP:method:*]-insert{%20:end:value:4}-|".into()),
//!     engine: Some(engine),
//!     encryption_key: Some(b"0123456789abcdef".to_vec()),
//!     ..wsveil::DialOpts::default()
//! };
//! let conn = wsveil::dial("tcp", "example.com:8080", opts).await?;
//! # drop(conn); Ok(()) }
//! ```
//!
//! ## What is and is not guaranteed
//!
//! The strategy is applied exactly once per client flow, before any
//! untransformed byte reaches the wire; normalization runs exactly once per
//! server flow, before any byte reaches a reader. The normalized request is
//! guaranteed to be *valid*, not byte-identical to what the client's
//! handshake machinery originally produced — many strategies are not
//! uniquely invertible. The cipher overlay provides confidentiality against
//! passive inspection only; pair it with TLS when endpoints face an active
//! attacker.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod strategy;
pub mod transport;

mod dialer;
mod listener;

pub use dialer::{dial, DialOpts};
pub use error::{Error, Result};
pub use listener::{ListenOpts, WsListener};
pub use strategy::{HttpStrategy, RequestNormalizer, StrategyEngine};
pub use transport::Conn;

use std::time::Duration;

/// Completed flows a listener will queue before handshakes start waiting
pub const CONN_QUEUE_CAPACITY: usize = 100;

/// Handshake errors the side channel will hold before dropping new ones
pub const ERROR_QUEUE_CAPACITY: usize = 20;

/// Bound on the WebSocket upgrade exchange, both directions
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
