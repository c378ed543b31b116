//! The HTTP transport to the dashboard proxy.

use std::time::Duration;

use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{FetchError, FetchResult};

/// The user agent sent with every request.
pub const USER_AGENT: &str = concat!("dashfeed/", env!("CARGO_PKG_VERSION"));

/// Creates a [`reqwest::Client`] for talking to the proxy.
///
/// The overall request timeout is not set here, it is enforced per endpoint class by the
/// [`Fetcher`](super::Fetcher).
pub fn create_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// The response envelope of the proxy.
///
/// Every proxied route answers with `{ "success": bool, "data": T, "message"?: string }`. A
/// `success` of `false` means the proxy itself was reached, but its upstream request failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    /// Unwraps the payload, turning failed envelopes into [`FetchError::Upstream`].
    pub fn into_result(self) -> FetchResult<T> {
        if !self.success {
            let message = self
                .message
                .unwrap_or_else(|| "proxy reported a failure".to_owned());
            return Err(FetchError::Upstream(message));
        }

        self.data
            .ok_or_else(|| FetchError::Malformed("envelope without data".to_owned()))
    }
}

/// Performs GET requests against the proxy and decodes the [`Envelope`] of the response.
///
/// This is cheap to clone, the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpFetcher {
    /// Creates a fetcher for the proxy at `base_url`.
    ///
    /// Endpoint paths are resolved relative to `base_url`, so `http://proxy/dashboard` and
    /// `http://proxy/dashboard/` are equivalent.
    pub fn new(client: reqwest::Client, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds the full URL of `endpoint` with the given query parameters.
    pub fn url(&self, endpoint: &str, query: &[(&str, &str)]) -> FetchResult<Url> {
        let mut url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|err| FetchError::NetworkError(format!("invalid endpoint {endpoint}: {err}")))?;

        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        Ok(url)
    }

    /// Fetches `endpoint` and decodes the `data` of its envelope into `T`.
    pub async fn get_json<T>(&self, endpoint: &str, query: &[(&str, &str)]) -> FetchResult<T>
    where
        T: DeserializeOwned,
    {
        let url = self.url(endpoint, query)?;
        tracing::trace!(%url, "Fetching from proxy");

        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%url, %status, "Proxy responded with unexpected status");
            return Err(FetchError::HttpError(status.as_u16()));
        }

        let body = response.bytes().await?;
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        envelope.into_result()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::caching::CacheKey;
    use crate::fetch::Fetcher;

    fn http_fetcher(base_url: Url) -> HttpFetcher {
        let client = create_client(Duration::from_secs(1)).unwrap();
        HttpFetcher::new(client, base_url)
    }

    #[tokio::test]
    async fn test_query_is_appended() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let http = http_fetcher(server.base_url());

        let data: Value = http
            .get_json("/echo/basis", &[("interval", "1h"), ("symbol", "BTCUSDT")])
            .await
            .unwrap();

        assert_eq!(data["path"], "/echo/basis");
        assert_eq!(data["query"], "interval=1h&symbol=BTCUSDT");
        assert_eq!(server.accesses(), 1);
    }

    #[tokio::test]
    async fn test_base_url_without_trailing_slash() {
        let http = http_fetcher("http://proxy.invalid/dashboard".parse().unwrap());

        let url = http.url("/api/fred/series", &[]).unwrap();
        assert_eq!(url.as_str(), "http://proxy.invalid/dashboard/api/fred/series");
    }

    #[tokio::test]
    async fn test_status_codes() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let http = http_fetcher(server.base_url());

        let result = http
            .get_json::<Value>("/respond_statuscode/404/basis", &[])
            .await;
        assert_eq!(result, Err(FetchError::HttpError(404)));

        let result = http
            .get_json::<Value>("/respond_statuscode/500/basis", &[])
            .await;
        assert_eq!(result, Err(FetchError::HttpError(500)));
    }

    #[tokio::test]
    async fn test_garbage_data() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let http = http_fetcher(server.base_url());

        let result = http.get_json::<Value>("/garbage_data/oops", &[]).await;
        assert!(matches!(result, Err(FetchError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_upstream_error() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let http = http_fetcher(server.base_url());

        let result = http.get_json::<Value>("/upstream_error/rate-limited", &[]).await;
        assert_eq!(result, Err(FetchError::Upstream("rate-limited".into())));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        dashfeed_test::setup();
        let http = http_fetcher("http://127.0.0.1:1/".parse().unwrap());

        let result = http.get_json::<Value>("/api/fred/series", &[]).await;
        assert!(matches!(result, Err(FetchError::NetworkError(_))));
    }

    #[tokio::test]
    async fn test_timeout_through_fetcher() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let http = Arc::new(http_fetcher(server.base_url()));
        let fetcher = Fetcher::<Value>::new("test", Duration::from_millis(100));

        let fetch = {
            let http = Arc::clone(&http);
            async move { http.get_json("/delay/1s/echo/basis", &[]).await }
        };
        let result = fetcher
            .fetch(
                &CacheKey::from("/echo/basis"),
                &CancellationToken::new(),
                fetch,
                |_| {},
            )
            .await;

        assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(100))));
    }

    #[test]
    fn test_envelope_without_message() {
        let envelope: Envelope<Value> = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert_eq!(
            envelope.into_result(),
            Err(FetchError::Upstream("proxy reported a failure".into()))
        );
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: Envelope<Vec<u32>> = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(matches!(
            envelope.into_result(),
            Err(FetchError::Malformed(_))
        ));
    }

    fn decode<T: DeserializeOwned>(body: &str) -> FetchResult<T> {
        serde_json::from_str::<Envelope<T>>(body)?.into_result()
    }

    #[test]
    fn test_envelope_of_payload_without_default() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Bar {
            close: f64,
        }

        let bars: Vec<Bar> = decode(r#"{"success": true, "data": [{"close": 1.5}]}"#).unwrap();
        assert_eq!(bars, [Bar { close: 1.5 }]);

        let missing = decode::<Bar>(r#"{"success": true}"#);
        assert!(matches!(missing, Err(FetchError::Malformed(_))));
    }
}
