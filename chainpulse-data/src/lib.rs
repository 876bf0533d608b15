#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cognitive_complexity,
    unused_crate_dependencies,
    unused_extern_crates,
    clippy::unused_self,
    clippy::useless_let_if_seq,
    missing_debug_implementations,
    rust_2018_idioms,
    rust_2024_compatibility
)]
#![allow(clippy::type_complexity, clippy::too_many_arguments, type_alias_bounds)]

//! # Chainpulse-Data
//! Resilient fetching, caching and analytics of blockchain network metrics for dashboard
//! consumers. Whatever the upstream providers do, every consumer receives a fully shaped result.
//!
//! **It is:**
//! * **Resilient**: failed or malformed category fetches are retried with exponential backoff
//!   and then replaced by schema-complete fallback bundles.
//! * **Cached**: raw and derived results live in a process-lifetime TTL [`CacheStore`] with
//!   pattern based invalidation.
//! * **Cancellable**: every logical request owns a `CancellationToken`; a newer request for the
//!   same key supersedes the older one.
//! * **Analytical**: rolling 7d / 30d / 90d averages and spike classification are derived for
//!   every metric of every bundle.
//!
//! ## Overview
//! * [`MetricsOrchestrator`] fans out one fetch per [`Category`] and merges the results into
//!   a single [`AggregateView`], published through a [`DashboardStore`] `watch` channel.
//! * [`PaginatedHistory`] loads long metric histories page by page.
//! * [`CategoryProvider`] and [`HistoryProvider`] abstract the upstream sources, with
//!   [`HttpProvider`] as the JSON-over-HTTP implementation.
//!
//! ## Example
//! ```rust,no_run
//! use chainpulse_data::{
//!     DataConfig, MetricsOrchestrator, Timeframe, provider::HttpProvider,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let provider = HttpProvider::new("https://metrics.example.com/api/".parse().unwrap());
//!     let orchestrator = Arc::new(MetricsOrchestrator::new(provider, DataConfig::default()));
//!
//!     let view = orchestrator.load("ethereum".into(), Timeframe::Month).await;
//!     println!("{:?}", view.usage.metrics.active_addresses);
//!
//!     let _auto_refresh = orchestrator.spawn_auto_refresh();
//! }
//! ```

/// TTL key/value [`CacheStore`] with pattern based invalidation.
pub mod cache;

/// [`DataConfig`] shared by the history fetcher and the orchestrator.
pub mod config;

/// All [`Error`](std::error::Error)s generated in Chainpulse-Data.
pub mod error;

/// Schema-complete placeholder bundles used when a category cannot be fetched.
pub mod fallback;

/// Paginated, cached, cancellable metric history loading.
pub mod history;

/// Domain model: categories, timeframes, snapshots, series and bundles.
pub mod model;

/// Parallel category fan-out with debounced and periodic refresh.
pub mod orchestrator;

/// Upstream collaborator traits and the HTTP implementation.
pub mod provider;

/// Bounded exponential-backoff retry with cooperative cancellation.
pub mod retry;

/// Spike classification of the latest observation against a rolling baseline.
pub mod spike;

/// Moving averages and summary statistics.
pub mod stats;

/// Explicit state container publishing [`AggregateView`]s.
pub mod store;

/// Validation boundary between raw provider payloads and the domain model.
pub mod validate;

pub use cache::CacheStore;
pub use config::DataConfig;
pub use error::DataError;
pub use history::{HistoryKey, HistoryStatus, HistoryView, PaginatedHistory};
pub use model::{Category, CategoryBundle, NetworkId, Timeframe};
pub use orchestrator::{MetricsOrchestrator, RefreshHandle};
pub use provider::{CategoryProvider, HistoryProvider, HttpProvider};
pub use store::{AggregateView, DashboardStore};
