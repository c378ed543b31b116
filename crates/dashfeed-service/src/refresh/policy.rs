use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheKey, CacheStore, CachedValue};
use crate::config::ClassSettings;
use crate::fetch::{FetchError, FetchHandle, FetchRequest, Fetcher};

use super::RefreshScope;

/// Where the payload of a [`Lookup`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// Served from the cache, younger than the TTL.
    Fresh,
    /// Served from the cache, older than the TTL. A revalidation is running.
    Stale,
    /// Fetched from the proxy while the caller waited.
    Fetched,
}

impl LookupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Fetched => "fetched",
        }
    }
}

/// The result of [`DataCache::request`].
#[derive(Debug, Clone)]
pub struct Lookup<T> {
    pub payload: T,
    pub status: LookupStatus,
    /// When the payload was fetched from the proxy.
    pub fetched_at: Instant,
    /// The background revalidation started for a [`Stale`](LookupStatus::Stale) payload.
    ///
    /// Awaiting it is optional, the cache is updated either way.
    pub revalidation: Option<FetchHandle<T>>,
}

/// A stale-while-revalidate cache in front of a [`FetchRequest`].
///
/// Fresh payloads are served from memory. Stale payloads are served immediately while a
/// revalidation runs in the background, unless the caller prefers to wait for fresh data. All
/// fetches of one key are de-duplicated, regardless of who started them.
///
/// Cloning is cheap and clones share their cache and in-flight fetches.
pub struct DataCache<R: FetchRequest> {
    name: Arc<str>,
    store: Arc<CacheStore<R::Payload>>,
    fetcher: Fetcher<R::Payload>,
}

impl<R: FetchRequest> Clone for DataCache<R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: Arc::clone(&self.store),
            fetcher: self.fetcher.clone(),
        }
    }
}

impl<R: FetchRequest> fmt::Debug for DataCache<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCache")
            .field("name", &self.name)
            .field("store", &self.store)
            .field("fetcher", &self.fetcher)
            .finish()
    }
}

impl<R: FetchRequest> DataCache<R> {
    /// Creates an empty cache.
    ///
    /// The `name` tags logs and metrics, `ttl` is the age after which payloads are revalidated and
    /// `timeout` bounds every fetch.
    pub fn new(name: impl Into<Arc<str>>, ttl: Duration, timeout: Duration) -> Self {
        let name = name.into();
        Self {
            store: Arc::new(CacheStore::new(ttl)),
            fetcher: Fetcher::new(Arc::clone(&name), timeout),
            name,
        }
    }

    /// Creates an empty cache with the TTL and timeout of an endpoint class.
    pub fn from_settings(name: impl Into<Arc<str>>, settings: &ClassSettings) -> Self {
        Self::new(name, settings.ttl, settings.timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.store.ttl()
    }

    /// Returns the payload for `request`, fetching it if necessary.
    ///
    /// - Without a cached payload, or with a stale one and `prefer_fresh`, this waits for a fetch
    ///   and returns its payload. Errors are returned and leave the cache unchanged.
    /// - A fresh payload is returned right away.
    /// - A stale payload is returned right away while a revalidation starts in the background.
    ///   Its outcome is available through [`Lookup::revalidation`], failures keep the stale
    ///   payload in place.
    ///
    /// Firing `cancel` abandons the wait and yields `Ok(None)`. If this call started the fetch,
    /// the fetch is aborted as well. Background revalidations are never cancelled through
    /// `cancel`, they are bounded by the timeout only.
    pub async fn request(
        &self,
        request: &R,
        prefer_fresh: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<Lookup<R::Payload>>, FetchError> {
        let name = &*self.name;
        let key = request.cache_key();
        metric!(counter("cache.access") += 1, "cache" => name);

        match self.store.get(&key) {
            Some(CachedValue {
                payload,
                fetched_at,
                is_stale: false,
            }) => {
                metric!(counter("cache.hit") += 1, "cache" => name, "status" => "fresh");
                return Ok(Some(Lookup {
                    payload,
                    status: LookupStatus::Fresh,
                    fetched_at,
                    revalidation: None,
                }));
            }
            Some(CachedValue {
                payload,
                fetched_at,
                is_stale: true,
            }) if !prefer_fresh => {
                metric!(counter("cache.hit") += 1, "cache" => name, "status" => "stale");
                tracing::trace!(cache = name, %key, "Serving stale payload, revalidating");
                let revalidation = self.fetch(request, &key, &CancellationToken::new());
                return Ok(Some(Lookup {
                    payload,
                    status: LookupStatus::Stale,
                    fetched_at,
                    revalidation: Some(revalidation),
                }));
            }
            _ => {
                metric!(counter("cache.miss") += 1, "cache" => name);
            }
        }

        let handle = self.fetch(request, &key, cancel);
        match handle.wait_cancellable(cancel).await {
            Ok(payload) => {
                // stamped by the success hook, unless the entry was cleared since
                let fetched_at = self
                    .store
                    .get(&key)
                    .map_or_else(Instant::now, |cached| cached.fetched_at);
                Ok(Some(Lookup {
                    payload,
                    status: LookupStatus::Fetched,
                    fetched_at,
                    revalidation: None,
                }))
            }
            Err(FetchError::Cancelled) => {
                tracing::trace!(cache = name, %key, "Request cancelled");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Starts or joins the fetch for `key`, writing its payload to the store on success.
    fn fetch(
        &self,
        request: &R,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> FetchHandle<R::Payload> {
        let store = Arc::clone(&self.store);
        let store_key = key.clone();
        self.fetcher
            .fetch(key, cancel, request.fetch(), move |payload: &R::Payload| {
                store.set(store_key, payload.clone())
            })
    }

    /// Returns the cached payload for `request` without fetching.
    pub fn get(&self, request: &R) -> Option<CachedValue<R::Payload>> {
        self.store.get(&request.cache_key())
    }

    /// Returns whether a fetch for `request` is currently running.
    pub fn is_fetching(&self, request: &R) -> bool {
        self.fetcher.in_flight(&request.cache_key()).is_some()
    }

    /// Removes all cached payloads.
    pub fn clear(&self) {
        tracing::debug!(cache = &*self.name, "Clearing cache");
        self.store.clear();
    }

    /// Removes the cached payload for `request`.
    pub fn clear_request(&self, request: &R) {
        self.store.clear_key(&request.cache_key());
    }

    /// Creates a [`RefreshScope`] that revalidates `request` in this cache.
    pub fn scope(&self, request: R) -> CacheRefresh<R> {
        CacheRefresh {
            cache: self.clone(),
            request,
            cancel: CancellationToken::new(),
        }
    }
}

/// Refreshes one request of a [`DataCache`], see [`DataCache::scope`].
///
/// A refresh is a regular [`request`](DataCache::request) that does not prefer fresh data, so a
/// fresh payload is left alone and a stale one is revalidated. The refresh completes once the
/// revalidation does, and fails if it fails.
#[derive(Debug, Clone)]
pub struct CacheRefresh<R: FetchRequest> {
    cache: DataCache<R>,
    request: R,
    cancel: CancellationToken,
}

impl<R: FetchRequest> CacheRefresh<R> {
    /// A token that cancels refreshes started through this scope.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl<R: FetchRequest> RefreshScope for CacheRefresh<R> {
    fn refresh(&self) -> BoxFuture<'_, Result<(), FetchError>> {
        async move {
            let lookup = self
                .cache
                .request(&self.request, false, &self.cancel)
                .await?;

            match lookup {
                Some(Lookup {
                    revalidation: Some(revalidation),
                    ..
                }) => revalidation.wait_cancellable(&self.cancel).await.map(|_| ()),
                Some(_) => Ok(()),
                None => Err(FetchError::Cancelled),
            }
        }
        .boxed()
    }
}
