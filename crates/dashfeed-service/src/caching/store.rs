use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use super::CacheKey;

/// A payload as it is kept in the [`CacheStore`].
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    payload: T,
    fetched_at: Instant,
}

/// A payload read from the [`CacheStore`], classified by its age.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<T> {
    /// The most recently fetched payload.
    pub payload: T,
    /// When the payload was written to the store.
    pub fetched_at: Instant,
    /// Whether the payload is older than the TTL of the store.
    pub is_stale: bool,
}

/// Stores the most recently fetched payload per [`CacheKey`].
///
/// Staleness is advisory: entries older than the TTL are still returned, only flagged as stale.
/// Entries are never evicted, they are only replaced by newer payloads or removed through
/// [`clear`](Self::clear) and [`clear_key`](Self::clear_key). The set of keys is expected to be
/// small, one per filter combination of a dashboard widget.
pub struct CacheStore<T> {
    ttl: Duration,
    entries: moka::sync::Cache<CacheKey, CacheEntry<T>>,
}

impl<T> fmt::Debug for CacheStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl<T> CacheStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an empty store whose entries turn stale after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: moka::sync::Cache::builder().build(),
        }
    }

    /// The age after which an entry is considered stale.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Looks up the payload for `key`.
    ///
    /// Returns `None` if the key was never written or has been cleared.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue<T>> {
        let CacheEntry {
            payload,
            fetched_at,
        } = self.entries.get(key)?;
        let age = Instant::now().saturating_duration_since(fetched_at);

        Some(CachedValue {
            payload,
            fetched_at,
            is_stale: age > self.ttl,
        })
    }

    /// Records `payload` as fetched now, replacing any previous entry for `key`.
    pub fn set(&self, key: CacheKey, payload: T) {
        tracing::trace!(%key, "Storing payload");
        let entry = CacheEntry {
            payload,
            fetched_at: Instant::now(),
        };
        self.entries.insert(key, entry);
    }

    /// Removes every entry.
    pub fn clear(&self) {
        // `invalidate_all` is lazy and only applies to entries older than the call
        for (key, _) in self.entries.iter() {
            self.entries.invalidate(&*key);
        }
    }

    /// Removes the entry for `key`.
    pub fn clear_key(&self, key: &CacheKey) {
        self.entries.invalidate(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_never_fetched_is_absent() {
        let store = CacheStore::<String>::new(TTL);
        assert!(store.get(&"BTC:1h".into()).is_none());
        assert!(store.get(&"ETH:4h".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_follows_ttl() {
        let store = CacheStore::new(TTL);
        let key = CacheKey::from("BTC:1h");

        store.set(key.clone(), "P1".to_owned());
        let value = store.get(&key).unwrap();
        assert_eq!(value.payload, "P1");
        assert!(!value.is_stale);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!store.get(&key).unwrap().is_stale);

        // exactly at the TTL the entry is still fresh
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!store.get(&key).unwrap().is_stale);

        tokio::time::advance(Duration::from_secs(10)).await;
        let value = store.get(&key).unwrap();
        assert_eq!(value.payload, "P1");
        assert!(value.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_refreshes() {
        let store = CacheStore::new(TTL);
        let key = CacheKey::from("BTC:1h");

        store.set(key.clone(), "P1".to_owned());
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(store.get(&key).unwrap().is_stale);

        store.set(key.clone(), "P2".to_owned());
        let value = store.get(&key).unwrap();
        assert_eq!(value.payload, "P2");
        assert!(!value.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_key() {
        let store = CacheStore::new(TTL);
        let btc = CacheKey::from("BTC:1h");
        let eth = CacheKey::from("ETH:1h");

        store.set(btc.clone(), 1);
        store.set(eth.clone(), 2);
        store.clear_key(&btc);

        assert!(store.get(&btc).is_none());
        assert_eq!(store.get(&eth).unwrap().payload, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let store = CacheStore::new(TTL);
        let btc = CacheKey::from("BTC:1h");
        let eth = CacheKey::from("ETH:1h");

        store.set(btc.clone(), 1);
        store.set(eth.clone(), 2);
        store.clear();

        assert!(store.get(&btc).is_none());
        assert!(store.get(&eth).is_none());
    }
}
