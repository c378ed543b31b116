use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use url::form_urlencoded;

/// The key of a cached payload.
///
/// A key is the stable rendering of an endpoint path together with its query parameters, sorted
/// by parameter name: `/api/coinglass/basis/history?interval=1h&symbol=BTCUSDT`. Two requests
/// that differ only in the order their parameters were added produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    key: Arc<str>,
}

impl CacheKey {
    /// Starts building a [`CacheKey`] for the given endpoint.
    pub fn builder(endpoint: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            endpoint: endpoint.to_owned(),
            params: BTreeMap::new(),
        }
    }

    /// Returns the rendered key.
    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self { key: key.into() }
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self { key: key.into() }
    }
}

/// A builder for [`CacheKey`]s.
///
/// Parameters are kept sorted by name. Setting the same parameter twice keeps the last value.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    endpoint: String,
    params: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
    /// Adds a query parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        if self.params.is_empty() {
            return CacheKey::from(self.endpoint);
        }

        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.params)
            .finish();
        CacheKey::from(format!("{}?{query}", self.endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_are_sorted() {
        let a = CacheKey::builder("/api/coinglass/basis/history")
            .param("symbol", "BTCUSDT")
            .param("interval", "1h")
            .param("limit", 500)
            .build();
        let b = CacheKey::builder("/api/coinglass/basis/history")
            .param("limit", 500)
            .param("interval", "1h")
            .param("symbol", "BTCUSDT")
            .build();

        assert_eq!(a, b);
        insta::assert_snapshot!(a, @"/api/coinglass/basis/history?interval=1h&limit=500&symbol=BTCUSDT");
    }

    #[test]
    fn test_distinct_params_distinct_keys() {
        let hourly = CacheKey::builder("/api/coinglass/basis/history")
            .param("interval", "1h")
            .build();
        let daily = CacheKey::builder("/api/coinglass/basis/history")
            .param("interval", "1d")
            .build();

        assert_ne!(hourly, daily);
    }

    #[test]
    fn test_no_params() {
        let key = CacheKey::builder("/api/coinglass/etf-flows/history").build();
        assert_eq!(key.as_str(), "/api/coinglass/etf-flows/history");
    }

    #[test]
    fn test_values_are_escaped() {
        let key = CacheKey::builder("/api/fred/series")
            .param("series_id", "DGS10")
            .param("note", "a&b=c d")
            .build();
        insta::assert_snapshot!(key, @"/api/fred/series?note=a%26b%3Dc+d&series_id=DGS10");
    }

    #[test]
    fn test_last_value_wins() {
        let key = CacheKey::builder("/vwap")
            .param("symbol", "ETHUSDT")
            .param("symbol", "BTCUSDT")
            .build();
        assert_eq!(key.as_str(), "/vwap?symbol=BTCUSDT");
    }
}
