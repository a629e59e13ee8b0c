#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! A quota / rate-limiting engine: given a limit (a count per time window,
//! scoped to a tenant+resource pair), it answers "has this caller exceeded
//! its quota, and how much is left".
//!
//! ## Features
//!
//! - **Calendar and rolling-window periods** with variable-length month
//!   arithmetic
//! - **Three counting strategies**: non-distributed (in-process),
//!   synchronous (every increment confirmed against a remote counting
//!   service), and asynchronous (local buffering with background
//!   reconciliation)
//! - **TTL bucket cache** so bursts for the same tenant+resource reuse one
//!   bucket and one reconciler task
//! - **Pluggable counter backend** via the [`counter::CounterStore`] trait
//!   (HTTP client included, in-memory store for tests)
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::counter::InMemoryCounterStore;
//! use floodgate::clock::SystemClock;
//! use floodgate::{EngineConfig, QuotaEngine, QuotaRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floodgate::QuotaError> {
//!     let engine = QuotaEngine::new(
//!         EngineConfig::default(),
//!         Arc::new(InMemoryCounterStore::new()),
//!         Arc::new(SystemClock),
//!     );
//!
//!     let request = QuotaRequest {
//!         edge_org_id: "acme".into(),
//!         id: "orders-api".into(),
//!         interval: 1,
//!         time_unit: "hour".into(),
//!         quota_type: "calendar".into(),
//!         precise_at_seconds_level: false,
//!         start_timestamp: None,
//!         max_count: 100,
//!         weight: 1,
//!         distributed: true,
//!         synchronous: true,
//!         sync_time_in_sec: None,
//!         sync_message_count: None,
//!     };
//!
//!     let result = engine.check(&request).await?;
//!     assert!(!result.exceeded);
//!     assert_eq!(result.remaining_count, 99);
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod cache;
pub mod clock;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod period;
mod reconciler;
pub mod request;
pub mod strategy;

// Re-exports
pub use bucket::{BucketConfig, BucketType, FlushTrigger, QuotaBucket};
pub use cache::BucketCache;
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use counter::{CounterStore, HttpCounterStore, InMemoryCounterStore};
pub use engine::QuotaEngine;
pub use error::{QuotaError, RemoteError};
pub use period::{Period, QuotaType, TimeUnit};
pub use request::{QuotaRequest, QuotaResult};
pub use strategy::{strategy_for, CountingStrategy};
