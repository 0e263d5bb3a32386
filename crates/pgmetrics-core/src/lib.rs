//! pgmetrics-core — shared library for the pgmetrics collector.
//!
//! Provides:
//! - `collector` — query results as nullable text tables, reduction into
//!   keyed statistic records, availability probing of optional views
//! - `sources` — statistic-source registry (builtin or loaded from JSON)
//! - `metrics` — samples emitted from records, text exposition rendering
//! - `poller` — one collection cycle over the registry

pub mod collector;
pub mod metrics;
pub mod poller;
pub mod sources;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
