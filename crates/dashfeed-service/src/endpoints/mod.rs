//! The proxy endpoints the dashboard reads from.
//!
//! Every endpoint belongs to an [`EndpointClass`], which determines how long its payloads stay
//! fresh, how long a fetch may take and how often it is refreshed. A [`FeedRequest`] combines an
//! endpoint with its query parameters and is what gets cached.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::caching::CacheKey;
use crate::fetch::http::HttpFetcher;
use crate::fetch::{FetchRequest, FetchResult};

mod market;

pub use market::*;

/// How quickly the data of an endpoint changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointClass {
    /// Live market data, like basis or liquidations.
    Live,
    /// Data published once per trading day, like ETF flows.
    Daily,
    /// Slow moving macro-economic series.
    Macro,
}

impl EndpointClass {
    pub fn name(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Daily => "daily",
            Self::Macro => "macro",
        }
    }

    /// The default age after which payloads of this class are stale.
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::Live => Duration::from_secs(30),
            Self::Daily => Duration::from_secs(30 * 60),
            Self::Macro => Duration::from_secs(6 * 3600),
        }
    }

    /// The default time a single fetch may take.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Live => Duration::from_secs(8),
            Self::Daily | Self::Macro => Duration::from_secs(30),
        }
    }

    /// The default interval of the auto-refresh.
    pub fn default_refresh_interval(self) -> Duration {
        match self {
            Self::Live => Duration::from_secs(15),
            Self::Daily => Duration::from_secs(5 * 60),
            Self::Macro => Duration::from_secs(30 * 60),
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The kind of payload an endpoint returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    /// Futures basis history, see [`BasisHistory`].
    Basis,
    /// Spot ETF flows, see [`EtfFlows`].
    EtfFlows,
    /// Liquidation history, see [`LiquidationHistory`].
    Liquidations,
    /// Spot VWAP with bands, see [`VwapSeries`].
    Vwap,
    /// FRED series observations, see [`MacroSeries`].
    Macro,
    /// Any other endpoint, decoded as plain JSON.
    Json,
}

impl EndpointKind {
    /// The path this endpoint is served at by the proxy.
    ///
    /// Plain JSON endpoints have no default and need an explicit path.
    pub fn default_path(self) -> Option<&'static str> {
        Some(match self {
            Self::Basis => BasisHistory::PATH,
            Self::EtfFlows => EtfFlows::PATH,
            Self::Liquidations => LiquidationHistory::PATH,
            Self::Vwap => VwapSeries::PATH,
            Self::Macro => MacroSeries::PATH,
            Self::Json => return None,
        })
    }

    pub fn class(self) -> EndpointClass {
        match self {
            Self::Basis | Self::Liquidations | Self::Vwap | Self::Json => EndpointClass::Live,
            Self::EtfFlows => EndpointClass::Daily,
            Self::Macro => EndpointClass::Macro,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Basis => "basis",
            Self::EtfFlows => "etf-flows",
            Self::Liquidations => "liquidations",
            Self::Vwap => "vwap",
            Self::Macro => "macro",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The value of a query parameter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => value.fmt(f),
            Self::Int(value) => value.fmt(f),
            Self::Float(value) => value.fmt(f),
            Self::Str(value) => value.fmt(f),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Query parameters of a request, sorted by name.
pub type QueryParams = BTreeMap<String, ParamValue>;

/// A decoded payload of any [`EndpointKind`].
///
/// Series are shared, so handing a cached payload to another reader does not copy it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FeedPayload {
    Basis(Arc<[BasisPoint]>),
    EtfFlows(Arc<[EtfFlow]>),
    Liquidations(Arc<[LiquidationBar]>),
    Vwap(Arc<[VwapPoint]>),
    Macro(Arc<[MacroObservation]>),
    Json(Arc<serde_json::Value>),
}

impl FeedPayload {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::Basis(_) => EndpointKind::Basis,
            Self::EtfFlows(_) => EndpointKind::EtfFlows,
            Self::Liquidations(_) => EndpointKind::Liquidations,
            Self::Vwap(_) => EndpointKind::Vwap,
            Self::Macro(_) => EndpointKind::Macro,
            Self::Json(_) => EndpointKind::Json,
        }
    }

    /// The number of data points, or `1` for a JSON payload that is not an array.
    pub fn len(&self) -> usize {
        match self {
            Self::Basis(points) => points.len(),
            Self::EtfFlows(flows) => flows.len(),
            Self::Liquidations(bars) => bars.len(),
            Self::Vwap(points) => points.len(),
            Self::Macro(observations) => observations.len(),
            Self::Json(value) => match &**value {
                serde_json::Value::Array(values) => values.len(),
                serde_json::Value::Null => 0,
                _ => 1,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_basis(&self) -> Option<&[BasisPoint]> {
        match self {
            Self::Basis(points) => Some(points),
            _ => None,
        }
    }

    pub fn as_etf_flows(&self) -> Option<&[EtfFlow]> {
        match self {
            Self::EtfFlows(flows) => Some(flows),
            _ => None,
        }
    }

    pub fn as_liquidations(&self) -> Option<&[LiquidationBar]> {
        match self {
            Self::Liquidations(bars) => Some(bars),
            _ => None,
        }
    }

    pub fn as_vwap(&self) -> Option<&[VwapPoint]> {
        match self {
            Self::Vwap(points) => Some(points),
            _ => None,
        }
    }

    pub fn as_macro(&self) -> Option<&[MacroObservation]> {
        match self {
            Self::Macro(observations) => Some(observations),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A request for one endpoint of the proxy with a fixed set of query parameters.
///
/// Cloning is cheap, the parameters and the HTTP client are shared.
#[derive(Debug, Clone)]
pub struct FeedRequest {
    kind: EndpointKind,
    endpoint: Arc<str>,
    params: Arc<QueryParams>,
    http: HttpFetcher,
}

impl FeedRequest {
    /// Creates a request for `endpoint`, decoding the response as `kind`.
    pub fn new(
        kind: EndpointKind,
        endpoint: impl Into<Arc<str>>,
        params: QueryParams,
        http: HttpFetcher,
    ) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            params: Arc::new(params),
            http,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    /// The class of the endpoint, see [`EndpointKind::class`].
    pub fn class(&self) -> EndpointClass {
        self.kind.class()
    }
}

impl FetchRequest for FeedRequest {
    type Payload = FeedPayload;

    fn cache_key(&self) -> CacheKey {
        self.params
            .iter()
            .fold(CacheKey::builder(&self.endpoint), |builder, (name, value)| {
                builder.param(name, value)
            })
            .build()
    }

    fn fetch(&self) -> BoxFuture<'static, FetchResult<FeedPayload>> {
        let request = self.clone();
        async move {
            let params: Vec<(&str, String)> = request
                .params
                .iter()
                .map(|(name, value)| (name.as_str(), value.to_string()))
                .collect();
            let query: Vec<(&str, &str)> = params
                .iter()
                .map(|(name, value)| (*name, value.as_str()))
                .collect();

            let http = &request.http;
            let endpoint = &*request.endpoint;
            let payload = match request.kind {
                EndpointKind::Basis => {
                    let mut points: Vec<BasisPoint> = http.get_json(endpoint, &query).await?;
                    points.sort_by_key(|point| point.time);
                    FeedPayload::Basis(points.into())
                }
                EndpointKind::EtfFlows => {
                    let mut flows: Vec<EtfFlow> = http.get_json(endpoint, &query).await?;
                    flows.sort_by(|a, b| a.date.cmp(&b.date));
                    FeedPayload::EtfFlows(flows.into())
                }
                EndpointKind::Liquidations => {
                    let mut bars: Vec<LiquidationBar> = http.get_json(endpoint, &query).await?;
                    bars.sort_by_key(|bar| bar.time);
                    FeedPayload::Liquidations(bars.into())
                }
                EndpointKind::Vwap => {
                    let mut points: Vec<VwapPoint> = http.get_json(endpoint, &query).await?;
                    points.sort_by_key(|point| point.timestamp);
                    FeedPayload::Vwap(points.into())
                }
                EndpointKind::Macro => {
                    let mut observations: Vec<MacroObservation> =
                        http.get_json(endpoint, &query).await?;
                    observations.sort_by(|a, b| a.date.cmp(&b.date));
                    FeedPayload::Macro(observations.into())
                }
                EndpointKind::Json => {
                    let value: serde_json::Value = http.get_json(endpoint, &query).await?;
                    FeedPayload::Json(Arc::new(value))
                }
            };

            Ok(payload)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::fetch::http::create_client;

    fn http_fetcher(server: &dashfeed_test::ProxyServer) -> HttpFetcher {
        let client = create_client(Duration::from_secs(1)).unwrap();
        HttpFetcher::new(client, server.base_url())
    }

    #[test]
    fn test_param_values_from_yaml() {
        let params: QueryParams = serde_yaml::from_str(
            r#"
            symbol: BTCUSDT
            interval: 1h
            limit: 500
            ratio: 0.5
            spot: true
            "#,
        )
        .unwrap();

        assert_eq!(params["symbol"], ParamValue::Str("BTCUSDT".into()));
        assert_eq!(params["interval"], ParamValue::Str("1h".into()));
        assert_eq!(params["limit"], ParamValue::Int(500));
        assert_eq!(params["ratio"], ParamValue::Float(0.5));
        assert_eq!(params["spot"], ParamValue::Bool(true));
    }

    #[test]
    fn test_class_defaults() {
        assert_eq!(EndpointClass::Live.default_ttl(), Duration::from_secs(30));
        assert_eq!(EndpointClass::Daily.default_ttl(), Duration::from_secs(1800));
        assert_eq!(EndpointClass::Macro.default_ttl(), Duration::from_secs(21600));
        assert_eq!(EndpointKind::EtfFlows.class(), EndpointClass::Daily);
        assert_eq!(EndpointKind::Json.default_path(), None);
    }

    #[tokio::test]
    async fn test_cache_key_rendering() {
        let server = dashfeed_test::ProxyServer::new();
        let request = BasisHistory {
            exchange: "Binance".into(),
            symbol: "BTCUSDT".into(),
            interval: "4h".into(),
            limit: 200,
        }
        .request(http_fetcher(&server));

        insta::assert_snapshot!(
            request.cache_key(),
            @"/api/coinglass/basis/history?exchange=Binance&interval=4h&limit=200&symbol=BTCUSDT"
        );
    }

    #[tokio::test]
    async fn test_basis_is_sorted_by_time() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let request = BasisHistory::default().request(http_fetcher(&server));

        let payload = request.fetch().await.unwrap();
        let points = payload.as_basis().unwrap();

        assert_eq!(points.len(), 2);
        assert!(points[0].time < points[1].time);
        assert_eq!(points[1].close_basis, 0.061);
        assert_eq!(server.hits(BasisHistory::PATH), 1);
    }

    #[tokio::test]
    async fn test_macro_series_missing_values() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let request = MacroSeries::new("DGS10").request(http_fetcher(&server));

        let payload = request.fetch().await.unwrap();
        let values: Vec<_> = payload
            .as_macro()
            .unwrap()
            .iter()
            .map(|observation| observation.value)
            .collect();

        assert_eq!(values, [Some(4.09), None, Some(4.15)]);
    }

    #[tokio::test]
    async fn test_json_endpoint() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        let mut params = QueryParams::new();
        params.insert("window".into(), ParamValue::Int(24));
        let request = FeedRequest::new(
            EndpointKind::Json,
            "/echo/funding",
            params,
            http_fetcher(&server),
        );

        let payload = request.fetch().await.unwrap();
        let value = payload.as_json().unwrap();

        assert_eq!(value["query"], "window=24");
        assert_eq!(payload.len(), 1);
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_malformed() {
        dashfeed_test::setup();
        let server = dashfeed_test::ProxyServer::new();
        // the echo endpoint answers with an object where a series is expected
        let request = FeedRequest::new(
            EndpointKind::Vwap,
            "/echo/vwap",
            QueryParams::new(),
            http_fetcher(&server),
        );

        let result = request.fetch().await;
        assert!(matches!(result, Err(FetchError::Malformed(_))));
    }
}
