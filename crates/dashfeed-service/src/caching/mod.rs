//! # Dashfeed caching
//!
//! Every dashboard widget asks for the same handful of series over and over: each filter change,
//! each auto-refresh tick and each newly mounted chart. The caching layer keeps the most recent
//! payload per request signature so these reads are served from memory.
//!
//! ## [`CacheKey`]
//!
//! A [`CacheKey`] is the stable rendering of an endpoint path plus its query parameters, sorted by
//! name. One key corresponds to one filter combination of one widget, so the number of keys stays
//! small and no eviction is needed.
//!
//! **NOTE**: Care must be taken to make sure that keys are stable, as equal requests would
//! otherwise be fetched and stored separately.
//!
//! ## [`CacheStore`]
//!
//! The store maps keys to the last successfully fetched payload and the time it was fetched.
//! Reads classify entries as fresh or stale against the TTL of the store; a stale entry is still
//! returned. Entries are replaced on every successful fetch and only ever removed by an explicit
//! clear.
//!
//! Deciding what to do with a stale entry is not the job of the store, see
//! [`DataCache`](crate::refresh::DataCache) for the stale-while-revalidate policy built on top.

mod cache_key;
mod store;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use store::{CacheStore, CachedValue};
