//! Data layer of the dashfeed market dashboard.
//!
//! Remote market data (basis, ETF flows, liquidations, VWAP, macro series) is served through a
//! [`DataCache`](refresh::DataCache), which keeps the most recent payload per request signature,
//! serves stale data while revalidating it in the background, and collapses concurrent fetches
//! of the same request into a single network round-trip. A [`Scheduler`](refresh::Scheduler)
//! drives periodic refreshes and stops itself after repeated failures.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod endpoints;
pub mod fetch;
pub mod logging;
pub mod refresh;
pub mod utils;
