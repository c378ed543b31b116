//! Helpers for testing the data layer against a local proxy.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`ProxyServer`], make sure that the server is held until all requests to the
//!    server have been made. If the server is dropped, the port is closed and all connections to it
//!    will fail. To avoid this, assign it to a variable: `let server = ProxyServer::new();`.
//!
//!  - Tests talking to a [`ProxyServer`] use real sockets and must not pause the tokio clock.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, extract, middleware};
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `dashfeed` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("dashfeed=trace,dashfeed_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Wraps `data` in the response envelope of the proxy.
pub fn envelope(data: Value) -> Value {
    json!({ "success": true, "data": data })
}

/// A basis history series with two points, newest first.
pub fn basis_history() -> Value {
    json!([
        {
            "time": 1_700_003_600_000_u64,
            "open_basis": 0.052,
            "close_basis": 0.061,
            "open_change": 12.5,
            "close_change": 14.0
        },
        {
            "time": 1_700_000_000_000_u64,
            "open_basis": 0.048,
            "close_basis": 0.052,
            "open_change": 11.0,
            "close_change": 12.5
        }
    ])
}

/// Two days of spot ETF flows.
pub fn etf_flows() -> Value {
    json!([
        { "date": "2024-03-11", "net_flow_usd": 505_600_000.0, "price_usd": 72_100.0 },
        { "date": "2024-03-12", "net_flow_usd": -77_100_000.0, "price_usd": 71_500.0 }
    ])
}

/// Aggregated liquidations for two intervals.
pub fn liquidation_history() -> Value {
    json!([
        { "time": 1_700_000_000_000_u64, "long_usd": 1_250_000.0, "short_usd": 310_000.0 },
        { "time": 1_700_003_600_000_u64, "long_usd": 220_000.0, "short_usd": 980_000.0 }
    ])
}

/// A VWAP series with bands.
pub fn vwap_series() -> Value {
    json!([
        {
            "timestamp": 1_700_000_000_000_u64,
            "vwap": 37_012.5,
            "upper_band": 37_250.0,
            "lower_band": 36_775.0
        },
        {
            "timestamp": 1_700_000_300_000_u64,
            "vwap": 37_020.1,
            "upper_band": 37_260.4,
            "lower_band": 36_779.8
        }
    ])
}

/// A macro series in the shape of FRED observations, including a missing value.
pub fn macro_series() -> Value {
    json!([
        { "date": "2024-03-08", "value": "4.09" },
        { "date": "2024-03-11", "value": "." },
        { "date": "2024-03-12", "value": "4.15" }
    ])
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A stand-in for the dashboard proxy that counts the requests it receives.
///
/// Besides the dashboard endpoints, which answer with the fixtures of this crate, the server has
/// a couple of routes to provoke failures:
///
///  - `/echo/*path` answers with an envelope containing the requested path and query string.
///  - `/delay/:time/*path` waits for the given humantime duration, then redirects to `/*path`.
///  - `/respond_statuscode/:num/*tail` answers with the given status code.
///  - `/garbage_data/*tail` answers with `tail` as a plain body.
///  - `/upstream_error/*tail` answers with a failed envelope carrying `tail` as its message.
pub struct ProxyServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ProxyServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/api/coinglass/basis/history",
                get(|| async { Json(envelope(basis_history())) }),
            )
            .route(
                "/api/coinglass/etf-flows/history",
                get(|| async { Json(envelope(etf_flows())) }),
            )
            .route(
                "/api/coinglass/liquidation/history",
                get(|| async { Json(envelope(liquidation_history())) }),
            )
            .route(
                "/api/spot-microstructure/vwap",
                get(|| async { Json(envelope(vwap_series())) }),
            )
            .route(
                "/api/fred/series",
                get(|| async { Json(envelope(macro_series())) }),
            )
            .route(
                "/echo/*path",
                get(
                    |extract::OriginalUri(uri): extract::OriginalUri| async move {
                        Json(envelope(json!({
                            "path": uri.path(),
                            "query": uri.query().unwrap_or_default(),
                        })))
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>,
                     extract::RawQuery(query): extract::RawQuery| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        let location = match query {
                            Some(query) => format!("/{path}?{query}"),
                            None => format!("/{path}"),
                        };
                        (StatusCode::FOUND, [("Location", location)])
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/upstream_error/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move {
                    upstream_error(&tail)
                }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns how often `path` was requested, regardless of the query string.
    pub fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// Returns the total number of requests and resets all counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the request count of every path and resets all counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// The base URL to configure as proxy.
    pub fn base_url(&self) -> Url {
        self.server.url("/")
    }
}

impl Default for ProxyServer {
    fn default() -> Self {
        Self::new()
    }
}

fn upstream_error(message: &str) -> Response {
    Json(json!({ "success": false, "data": null, "message": message })).into_response()
}
