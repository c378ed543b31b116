use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::{EndpointKind, FeedRequest, ParamValue, QueryParams};
use crate::fetch::http::HttpFetcher;

/// One interval of the futures basis, in percent of the spot price.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BasisPoint {
    /// Start of the interval in milliseconds since the epoch.
    pub time: u64,
    pub open_basis: f64,
    pub close_basis: f64,
    #[serde(default)]
    pub open_change: Option<f64>,
    #[serde(default)]
    pub close_change: Option<f64>,
}

/// Net flows into spot ETFs on one trading day.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EtfFlow {
    /// The trading day as `YYYY-MM-DD`.
    pub date: String,
    /// Net inflow in USD, negative for outflows.
    pub net_flow_usd: f64,
    #[serde(default)]
    pub price_usd: Option<f64>,
}

/// Liquidated notional in USD during one interval.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LiquidationBar {
    pub time: u64,
    pub long_usd: f64,
    pub short_usd: f64,
}

impl LiquidationBar {
    pub fn total_usd(&self) -> f64 {
        self.long_usd + self.short_usd
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VwapPoint {
    pub timestamp: u64,
    pub vwap: f64,
    #[serde(default)]
    pub upper_band: Option<f64>,
    #[serde(default)]
    pub lower_band: Option<f64>,
}

/// One observation of a FRED series.
///
/// FRED reports missing observations as `"."`, these are decoded as `None`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MacroObservation {
    pub date: String,
    #[serde(default, deserialize_with = "deserialize_observation")]
    pub value: Option<f64>,
}

fn deserialize_observation<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) => match text.trim() {
            "" | "." => Ok(None),
            text => text.parse().map(Some).map_err(D::Error::custom),
        },
    }
}

/// Basis history of a perpetual or futures market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasisHistory {
    pub exchange: String,
    pub symbol: String,
    pub interval: String,
    pub limit: u32,
}

impl BasisHistory {
    pub const PATH: &'static str = "/api/coinglass/basis/history";

    pub fn request(&self, http: HttpFetcher) -> FeedRequest {
        let params = QueryParams::from([
            ("exchange".to_owned(), ParamValue::from(self.exchange.as_str())),
            ("symbol".to_owned(), self.symbol.as_str().into()),
            ("interval".to_owned(), self.interval.as_str().into()),
            ("limit".to_owned(), self.limit.into()),
        ]);
        FeedRequest::new(EndpointKind::Basis, Self::PATH, params, http)
    }
}

impl Default for BasisHistory {
    fn default() -> Self {
        Self {
            exchange: "Binance".to_owned(),
            symbol: "BTCUSDT".to_owned(),
            interval: "1h".to_owned(),
            limit: 500,
        }
    }
}

/// Daily flows of all spot ETFs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EtfFlows;

impl EtfFlows {
    pub const PATH: &'static str = "/api/coinglass/etf-flows/history";

    pub fn request(&self, http: HttpFetcher) -> FeedRequest {
        FeedRequest::new(EndpointKind::EtfFlows, Self::PATH, QueryParams::new(), http)
    }
}

/// Liquidation history of one symbol, aggregated over all exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationHistory {
    pub symbol: String,
    pub interval: String,
}

impl LiquidationHistory {
    pub const PATH: &'static str = "/api/coinglass/liquidation/history";

    pub fn request(&self, http: HttpFetcher) -> FeedRequest {
        let params = QueryParams::from([
            ("symbol".to_owned(), ParamValue::from(self.symbol.as_str())),
            ("interval".to_owned(), self.interval.as_str().into()),
        ]);
        FeedRequest::new(EndpointKind::Liquidations, Self::PATH, params, http)
    }
}

impl Default for LiquidationHistory {
    fn default() -> Self {
        Self {
            symbol: "BTC".to_owned(),
            interval: "1h".to_owned(),
        }
    }
}

/// Spot VWAP of one symbol on one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VwapSeries {
    pub symbol: String,
    pub timeframe: String,
    pub exchange: String,
}

impl VwapSeries {
    pub const PATH: &'static str = "/api/spot-microstructure/vwap";

    pub fn request(&self, http: HttpFetcher) -> FeedRequest {
        let params = QueryParams::from([
            ("symbol".to_owned(), ParamValue::from(self.symbol.as_str())),
            ("timeframe".to_owned(), self.timeframe.as_str().into()),
            ("exchange".to_owned(), self.exchange.as_str().into()),
        ]);
        FeedRequest::new(EndpointKind::Vwap, Self::PATH, params, http)
    }
}

impl Default for VwapSeries {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_owned(),
            timeframe: "5min".to_owned(),
            exchange: "binance".to_owned(),
        }
    }
}

/// Observations of a FRED series, like `DGS10` or `CPIAUCSL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroSeries {
    pub series_id: String,
    pub limit: Option<u32>,
}

impl MacroSeries {
    pub const PATH: &'static str = "/api/fred/series";

    pub fn new(series_id: impl Into<String>) -> Self {
        Self {
            series_id: series_id.into(),
            limit: None,
        }
    }

    pub fn request(&self, http: HttpFetcher) -> FeedRequest {
        let mut params = QueryParams::new();
        params.insert("series_id".to_owned(), self.series_id.as_str().into());
        if let Some(limit) = self.limit {
            params.insert("limit".to_owned(), limit.into());
        }
        FeedRequest::new(EndpointKind::Macro, Self::PATH, params, http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_values() {
        let observations: Vec<MacroObservation> = serde_json::from_str(
            r#"[
                {"date": "2024-01-01", "value": "3.95"},
                {"date": "2024-01-02", "value": "."},
                {"date": "2024-01-03", "value": 4.0},
                {"date": "2024-01-04", "value": null}
            ]"#,
        )
        .unwrap();

        let values: Vec<_> = observations.iter().map(|o| o.value).collect();
        assert_eq!(values, [Some(3.95), None, Some(4.0), None]);
    }

    #[test]
    fn test_invalid_observation() {
        let result = serde_json::from_str::<MacroObservation>(r#"{"date": "x", "value": "n/a"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_liquidation_total() {
        let bar = LiquidationBar {
            time: 0,
            long_usd: 1_250_000.0,
            short_usd: 310_000.0,
        };
        assert_eq!(bar.total_usd(), 1_560_000.0);
    }
}
