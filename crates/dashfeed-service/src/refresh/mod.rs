//! # Refreshing cached data
//!
//! ## [`DataCache`]
//!
//! The [`DataCache`] implements stale-while-revalidate on top of the
//! [`CacheStore`](crate::caching::CacheStore) and the [`Fetcher`](crate::fetch::Fetcher):
//!
//! | cached payload | `prefer_fresh` | behavior                                           |
//! |----------------|----------------|----------------------------------------------------|
//! | none           | any            | wait for a fetch                                   |
//! | fresh          | any            | return it, no network call                         |
//! | stale          | `false`        | return it, revalidate in the background            |
//! | stale          | `true`         | wait for a fetch, keep the stale payload on errors |
//!
//! Only successful fetches write to the cache, and only once per fetch.
//!
//! ## [`Scheduler`]
//!
//! A [`Scheduler`] drives periodic refreshes of a [`RefreshScope`], usually created through
//! [`DataCache::scope`]. Its state machine is [`AutoRefresh`]: ticks are skipped while a refresh
//! is running or the scope is hidden, and repeated failures trip a circuit breaker that stops the
//! refreshes until a cooldown has passed.

mod policy;
mod scheduler;

pub use policy::{CacheRefresh, DataCache, Lookup, LookupStatus};
pub use scheduler::{
    AutoRefresh, MIN_INTERVAL, RefreshScope, Scheduler, SchedulerState, SchedulerStatus,
    SkipReason, TickDecision,
};
