//! Turns the configured feeds into caches and schedulers.
use std::future::Future;

use anyhow::{Context, Result};
use dashfeed_service::config::{ClassSettings, Config, FeedConfig, SchedulerConfig};
use dashfeed_service::endpoints::{EndpointClass, FeedPayload, FeedRequest};
use dashfeed_service::fetch::FetchRequest;
use dashfeed_service::fetch::http::{HttpFetcher, create_client};
use dashfeed_service::refresh::{DataCache, Scheduler};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

/// A configured feed together with its cache.
#[derive(Debug)]
pub struct Feed {
    name: String,
    class: EndpointClass,
    settings: ClassSettings,
    request: FeedRequest,
    cache: DataCache<FeedRequest>,
}

impl Feed {
    pub fn new(config: &FeedConfig, settings: ClassSettings, http: HttpFetcher) -> Result<Self> {
        let path = config
            .path()
            .with_context(|| format!("feed `{}` has no path", config.name))?;
        let request = FeedRequest::new(config.endpoint, path, config.params.clone(), http);

        Ok(Self {
            name: config.name.clone(),
            class: config.class(),
            settings,
            request,
            cache: DataCache::from_settings(config.name.as_str(), &settings),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One line for the `feeds` listing: name, endpoint, class and cache key.
    pub fn describe(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.name,
            self.request.kind(),
            self.class,
            self.request.cache_key()
        )
    }

    /// Starts refreshing this feed at the interval of its class.
    pub fn spawn_scheduler(&self, config: &SchedulerConfig) -> Scheduler {
        Scheduler::spawn(
            self.name.as_str(),
            config,
            self.settings.refresh_interval,
            self.cache.scope(self.request.clone()),
        )
    }

    /// Requests the payload of this feed, see [`DataCache::request`].
    ///
    /// Returns `None` if `cancel` fired before the payload arrived.
    pub async fn fetch(
        &self,
        prefer_fresh: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<FeedPayload>> {
        let lookup = self
            .cache
            .request(&self.request, prefer_fresh, cancel)
            .await
            .with_context(|| format!("failed to fetch feed `{}`", self.name))?;

        Ok(lookup.map(|lookup| {
            tracing::debug!(
                feed = self.name.as_str(),
                status = lookup.status.as_str(),
                items = lookup.payload.len(),
                "Fetched feed"
            );
            lookup.payload
        }))
    }
}

fn http_fetcher(config: &Config) -> Result<HttpFetcher> {
    let client = create_client(config.connect_timeout).context("failed to create HTTP client")?;
    Ok(HttpFetcher::new(client, config.proxy_url.clone()))
}

/// Creates a [`Feed`] for every configured feed, all sharing one HTTP client.
pub fn build_feeds(config: &Config) -> Result<Vec<Feed>> {
    let http = http_fetcher(config)?;
    config
        .feeds
        .iter()
        .map(|feed| Feed::new(feed, config.classes.resolve(feed.class()), http.clone()))
        .collect()
}

/// Creates the [`Feed`] named `name`.
pub fn build_feed(config: &Config, name: &str) -> Result<Feed> {
    let feed = config
        .feed(name)
        .with_context(|| format!("unknown feed `{name}`"))?;
    Feed::new(feed, config.classes.resolve(feed.class()), http_fetcher(config)?)
}

/// Refreshes all `feeds` until `shutdown` resolves.
pub async fn run_schedulers<F>(config: &SchedulerConfig, feeds: &[Feed], shutdown: F)
where
    F: Future<Output = ()>,
{
    let schedulers: Vec<_> = feeds
        .iter()
        .map(|feed| feed.spawn_scheduler(config))
        .collect();
    tracing::info!("Refreshing {} feeds", schedulers.len());

    shutdown.await;

    tracing::info!("Stopping schedulers");
    join_all(schedulers.into_iter().map(Scheduler::shutdown)).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dashfeed_service::endpoints::{BasisHistory, EndpointKind};
    use dashfeed_test::ProxyServer;

    use super::*;

    fn feed_config(name: &str, endpoint: EndpointKind) -> FeedConfig {
        FeedConfig {
            name: name.into(),
            endpoint,
            path: None,
            class: None,
            params: Default::default(),
        }
    }

    fn config(server: &ProxyServer) -> Config {
        let mut basis = feed_config("btc-basis", EndpointKind::Basis);
        basis.params.insert("symbol".into(), "BTCUSDT".into());
        basis.params.insert("interval".into(), "1h".into());

        let mut echo = feed_config("echo", EndpointKind::Json);
        echo.path = Some("/echo/funding".into());
        echo.class = Some(EndpointClass::Daily);

        Config {
            proxy_url: server.base_url(),
            feeds: vec![basis, echo, feed_config("etf", EndpointKind::EtfFlows)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_describe() {
        dashfeed_test::setup();
        let server = ProxyServer::new();
        let feeds = build_feeds(&config(&server)).unwrap();

        let lines: Vec<_> = feeds.iter().map(Feed::describe).collect();
        assert_eq!(
            lines,
            [
                "btc-basis\tbasis\tlive\t/api/coinglass/basis/history?interval=1h&symbol=BTCUSDT",
                "echo\tjson\tdaily\t/echo/funding",
                "etf\tetf-flows\tdaily\t/api/coinglass/etf-flows/history",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_feed() {
        dashfeed_test::setup();
        let server = ProxyServer::new();
        let err = build_feed(&config(&server), "eth-basis").unwrap_err();
        assert_eq!(err.to_string(), "unknown feed `eth-basis`");
    }

    #[tokio::test]
    async fn test_fetch_feed() {
        dashfeed_test::setup();
        let server = ProxyServer::new();
        let feed = build_feed(&config(&server), "btc-basis").unwrap();
        let cancel = CancellationToken::new();

        let payload = feed.fetch(false, &cancel).await.unwrap().unwrap();
        let basis = payload.as_basis().unwrap();
        assert_eq!(basis.len(), 2);
        assert!(basis[0].time < basis[1].time);

        // served from the cache
        feed.fetch(false, &cancel).await.unwrap().unwrap();
        assert_eq!(server.hits(BasisHistory::PATH), 1);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json[1]["close_basis"], 0.061);
    }

    #[tokio::test]
    async fn test_fetch_cancelled() {
        dashfeed_test::setup();
        let server = ProxyServer::new();
        let feed = build_feed(&config(&server), "echo").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(feed.fetch(true, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_error() {
        dashfeed_test::setup();
        let server = ProxyServer::new();
        let mut config = config(&server);
        config.feeds[1].path = Some("/respond_statuscode/503/funding".into());
        let feed = build_feed(&config, "echo").unwrap();

        let err = feed
            .fetch(false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "failed to fetch feed `echo`");
        assert!(feed.cache.get(&feed.request).is_none());
    }

    #[tokio::test]
    async fn test_run_schedulers() {
        dashfeed_test::setup();
        let server = ProxyServer::new();
        let config = config(&server);
        let feeds = build_feeds(&config).unwrap();

        // the first refresh of every feed happens right away
        let all_cached = async {
            while !feeds
                .iter()
                .all(|feed| feed.cache.get(&feed.request).is_some())
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(
            Duration::from_secs(5),
            run_schedulers(&config.scheduler, &feeds, all_cached),
        )
        .await
        .unwrap();

        let hits = [
            ("/api/coinglass/basis/history".to_owned(), 1),
            ("/api/coinglass/etf-flows/history".to_owned(), 1),
            ("/echo/funding".to_owned(), 1),
        ];
        assert_eq!(server.all_hits(), hits);
    }
}
