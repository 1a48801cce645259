//! # Meshline Adapters
//!
//! Connector execution core for the integration mesh:
//! - Layered configuration (instance > type-global > system default)
//! - Connection lease pooling per adapter instance
//! - Cursor-tracked incremental polling with ordered hand-off
//! - Batched, idempotent outbound delivery with resume
//! - Retry policy + sliding-window error budget
//! - Token-bucket rate limiting and webhook signature verification
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │         Adapter Manager (registry + operator)       │
//! └────────────┬────────────────────────────────────────┘
//!              │
//!     ┌────────┴────────────────┐
//!     │                         │
//! ┌───▼──────────────┐ ┌────────▼─────────┐
//! │ PollingScheduler │ │ DeliveryExecutor │
//! │    (inbound)     │ │    (outbound)    │
//! └───┬──────────────┘ └────────┬─────────┘
//!     │                         │
//! ┌───▼─────────────────────────▼─────────────────────┐
//! │  Lease Pool + Retry/Budget + Dedup + Dead Letter  │
//! └────────────────────────┬──────────────────────────┘
//!                          │
//!                 ┌────────▼────────┐
//!                 │ Transport impls │
//!                 │ (per protocol)  │
//!                 └─────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod cursor;
pub mod dead_letter;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod poller;
pub mod rate_limit;
pub mod retry;
pub mod transport;
pub mod types;
pub mod webhook;

pub use error::{Error, Result};
pub use manager::AdapterManager;
pub use transport::{Sink, Transport};
pub use types::*;

/// Default total attempt cap per transport operation
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default inbound polling interval (milliseconds)
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 30_000;

/// Default transport call timeout (milliseconds)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// Default failures tolerated per error-budget window
pub const DEFAULT_ERROR_THRESHOLD: u64 = 25;

/// Default error-budget window (seconds)
pub const DEFAULT_ERROR_WINDOW_SECONDS: u64 = 300;
