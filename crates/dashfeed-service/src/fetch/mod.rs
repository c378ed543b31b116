//! Fetching payloads from the proxy.
//!
//! The [`Fetcher`] runs exactly one round-trip per [`CacheKey`] at a time. Concurrent fetches of
//! the same key share a single [`FetchHandle`], and all of them observe the same outcome. Every
//! fetch is bounded by a timeout and can be cancelled cooperatively.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::caching::CacheKey;
use crate::utils::defer::defer;

mod fetch_error;
pub mod http;

pub use fetch_error::FetchError;

/// The outcome of a fetch.
pub type FetchResult<T> = Result<T, FetchError>;

/// A request for a payload that can be cached.
///
/// Implementors describe how to compute the [`CacheKey`] of the request and how to fetch and
/// decode its payload. The returned future must not borrow from the request, as it is spawned
/// and may outlive the caller.
pub trait FetchRequest: 'static + Send + Sync + Clone {
    /// The decoded payload.
    ///
    /// Payloads are handed out to every reader, so this should be cheap to clone.
    type Payload: 'static + Send + Sync + Clone;

    /// The key under which the payload of this request is cached.
    fn cache_key(&self) -> CacheKey;

    /// Performs a single round-trip and decodes the payload.
    fn fetch(&self) -> BoxFuture<'static, FetchResult<Self::Payload>>;
}

/// A pending fetch, shared between everyone interested in its outcome.
///
/// Awaiting the handle yields the outcome of the underlying fetch. Dropping the handle does not
/// cancel the fetch.
#[derive(Clone)]
pub struct FetchHandle<T> {
    key: CacheKey,
    inner: Shared<BoxFuture<'static, FetchResult<T>>>,
}

impl<T> fmt::Debug for FetchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl<T: Clone> FetchHandle<T> {
    /// The key this fetch is running for.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Waits for the outcome, or until `cancel` fires.
    ///
    /// Cancelling only abandons this wait, other waiters and the fetch itself are not affected.
    pub async fn wait_cancellable(self, cancel: &CancellationToken) -> FetchResult<T> {
        tokio::select! {
            biased;
            result = self => result,
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
        }
    }
}

impl<T: Clone> Future for FetchHandle<T> {
    type Output = FetchResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

type InFlight<T> = Arc<Mutex<HashMap<CacheKey, FetchHandle<T>>>>;

/// Runs fetches with a timeout, de-duplicating concurrent fetches of the same key.
pub struct Fetcher<T> {
    name: Arc<str>,
    timeout: Duration,
    in_flight: InFlight<T>,
}

impl<T> fmt::Debug for Fetcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("Fetcher")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("in flight", &in_flight)
            .finish()
    }
}

impl<T> Clone for Fetcher<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            timeout: self.timeout,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<T> Fetcher<T>
where
    T: 'static + Send + Sync + Clone,
{
    /// Creates a fetcher. The `name` is used to tag logs and metrics.
    pub fn new(name: impl Into<Arc<str>>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            in_flight: Default::default(),
        }
    }

    /// The timeout applied to every fetch.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the pending fetch for `key`, if there is one.
    pub fn in_flight(&self, key: &CacheKey) -> Option<FetchHandle<T>> {
        self.in_flight.lock().unwrap().get(key).cloned()
    }

    /// Starts fetching `key`, or joins the fetch that is already running for it.
    ///
    /// When a new fetch is started, `fetch` is spawned as a background task and raced against the
    /// timeout and the `cancel` token. On success, `on_success` runs before the outcome is handed
    /// to any waiter; this is where callers persist the payload. When joining a running fetch,
    /// `fetch`, `cancel` and `on_success` are dropped unused.
    ///
    /// The fetch keeps running when all handles are dropped, so a background revalidation
    /// completes even after its caller went away.
    pub fn fetch<F, S>(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
        fetch: F,
        on_success: S,
    ) -> FetchHandle<T>
    where
        F: Future<Output = FetchResult<T>> + Send + 'static,
        S: FnOnce(&T) + Send + 'static,
    {
        let name = &*self.name;
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(handle) = in_flight.get(key) {
            metric!(counter("fetch.coalesced") += 1, "fetcher" => name);
            tracing::trace!(fetcher = name, %key, "Joining running fetch");
            return handle.clone();
        }

        metric!(counter("fetch.start") += 1, "fetcher" => name);
        tracing::trace!(fetcher = name, %key, "Spawning fetch");

        let done_token = {
            let name = Arc::clone(&self.name);
            let key = key.clone();
            let in_flight = Arc::clone(&self.in_flight);
            defer(move || {
                let mut in_flight = in_flight.lock().unwrap();
                in_flight.remove(&key);
                metric!(gauge("fetch.in_flight") = in_flight.len() as u64, "fetcher" => &*name);
            })
        };

        let task = {
            let name = Arc::clone(&self.name);
            let key = key.clone();
            let timeout = self.timeout;
            let cancel = cancel.clone();
            async move {
                let _done_token = done_token; // move into the future
                let started = Instant::now();

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(FetchError::Cancelled),
                    result = tokio::time::timeout(timeout, fetch) => {
                        result.unwrap_or(Err(FetchError::Timeout(timeout)))
                    }
                };

                let status = match &result {
                    Ok(payload) => {
                        on_success(payload);
                        "ok"
                    }
                    Err(FetchError::Cancelled) => {
                        tracing::debug!(fetcher = &*name, %key, "Fetch cancelled");
                        "cancelled"
                    }
                    Err(err) => {
                        tracing::debug!(
                            error = err as &dyn std::error::Error,
                            fetcher = &*name,
                            %key,
                            "Fetch failed",
                        );
                        err.metrics_tag()
                    }
                };
                metric!(counter("fetch.done") += 1, "fetcher" => &*name, "status" => status);
                metric!(timer("fetch.duration") = started.elapsed(), "fetcher" => &*name);

                result
            }
        };

        let task = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
        let inner = async move { task.await.unwrap_or(Err(FetchError::Aborted)) }
            .boxed()
            .shared();

        let handle = FetchHandle {
            key: key.clone(),
            inner,
        };
        in_flight.insert(key.clone(), handle.clone());
        metric!(gauge("fetch.in_flight") = in_flight.len() as u64, "fetcher" => name);
        handle
    }
}
