//! CoinGecko client: generalist price index and free historical archive.
//!
//! Covers three roles: spot price for major symbols, price at an arbitrary
//! past timestamp, and forward daily OHLC (bucketed from the market-chart
//! series). An explicit empty archive response is how dead tokens surface;
//! it is mapped to `NotFound` here and to `DeadToken` by the price service.

use crate::config::ProviderConfig;
use crate::models::{day_bucket, DailyBar, PriceReading, DAY_SECS};
use crate::price::resolver;
use crate::providers::{
    HistoricalPriceSource, OhlcSource, ProviderError, ProviderQuery, RateLimitedFetcher,
    SpotPriceSource,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

const API_BASE: &str = "https://api.coingecko.com/api/v3";

/// How far from the requested timestamp an archive point may be and still
/// count as "the price at" that timestamp.
const NEAREST_POINT_MAX_SKEW_SECS: i64 = DAY_SECS;

pub struct CoinGeckoClient {
    fetcher: RateLimitedFetcher,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SimplePriceEntry {
    usd: f64,
    #[serde(default)]
    usd_market_cap: Option<f64>,
    #[serde(default)]
    usd_24h_vol: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MarketChartResponse {
    /// `[[timestamp_ms, price], …]`
    #[serde(default)]
    prices: Vec<(f64, f64)>,
}

impl CoinGeckoClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            fetcher: RateLimitedFetcher::new(
                "coingecko",
                config.budget_per_minute(),
                config.timeout(),
            ),
            api_key: config.api_key.clone(),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        match &self.api_key {
            Some(key) => vec![("x-cg-demo-api-key", key.clone())],
            None => Vec::new(),
        }
    }

    /// Range-chart path for this token: coin id for majors, contract path
    /// for address-only tokens.
    fn chart_path(query: &ProviderQuery) -> Result<String, ProviderError> {
        if let Some(id) = &query.archive_id {
            return Ok(format!("{}/coins/{}/market_chart/range", API_BASE, id));
        }
        if let Some(address) = &query.address {
            let platform =
                resolver::coingecko_platform(query.chain).ok_or(ProviderError::NotFound)?;
            return Ok(format!(
                "{}/coins/{}/contract/{}/market_chart/range",
                API_BASE, platform, address
            ));
        }
        Err(ProviderError::NotFound)
    }

    async fn fetch_range(
        &self,
        query: &ProviderQuery,
        from: i64,
        until: i64,
        deadline: Instant,
    ) -> Result<Vec<(i64, f64)>, ProviderError> {
        let url = Self::chart_path(query)?;
        let params = [
            ("vs_currency", "usd".to_string()),
            ("from", from.to_string()),
            ("to", until.to_string()),
        ];
        let response: MarketChartResponse = self
            .fetcher
            .get_json(&url, &params, &self.headers(), deadline)
            .await?;

        let points: Vec<(i64, f64)> = response
            .prices
            .into_iter()
            .map(|(ms, price)| ((ms / 1000.0) as i64, price))
            .filter(|(_, price)| price.is_finite() && *price > 0.0)
            .collect();
        debug!(
            from,
            until,
            points = points.len(),
            "coingecko range fetched"
        );
        Ok(points)
    }
}

/// Fold a raw price series into daily bars.
fn bucket_daily(points: &[(i64, f64)]) -> Vec<DailyBar> {
    let mut bars: Vec<DailyBar> = Vec::new();
    for &(ts, price) in points {
        let day_ts = day_bucket(ts);
        match bars.last_mut() {
            Some(bar) if bar.day_ts == day_ts => {
                bar.high = bar.high.max(price);
                bar.low = bar.low.min(price);
                bar.close = price;
            }
            _ => bars.push(DailyBar {
                day_ts,
                open: price,
                high: price,
                low: price,
                close: price,
            }),
        }
    }
    bars
}

#[async_trait]
impl SpotPriceSource for CoinGeckoClient {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn current_price(
        &self,
        query: &ProviderQuery,
        deadline: Instant,
    ) -> Result<PriceReading, ProviderError> {
        let id = query.archive_id.as_deref().ok_or(ProviderError::NotFound)?;

        let url = format!("{}/simple/price", API_BASE);
        let params = [
            ("ids", id.to_string()),
            ("vs_currencies", "usd".to_string()),
            ("include_market_cap", "true".to_string()),
            ("include_24hr_vol", "true".to_string()),
        ];
        let response: HashMap<String, SimplePriceEntry> = self
            .fetcher
            .get_json(&url, &params, &self.headers(), deadline)
            .await?;

        let entry = response.get(id).ok_or(ProviderError::NotFound)?;
        if !entry.usd.is_finite() || entry.usd <= 0.0 {
            return Err(ProviderError::Parse(format!(
                "non-positive price {} for {}",
                entry.usd, id
            )));
        }

        Ok(PriceReading {
            price: entry.usd,
            market_cap: entry.usd_market_cap,
            liquidity: None,
            volume_24h: entry.usd_24h_vol,
            symbol_resolved: query.symbol.clone(),
            source: SpotPriceSource::name(self),
        })
    }
}

#[async_trait]
impl HistoricalPriceSource for CoinGeckoClient {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn price_at(
        &self,
        query: &ProviderQuery,
        ts: i64,
        deadline: Instant,
    ) -> Result<f64, ProviderError> {
        let points = self
            .fetch_range(query, ts - DAY_SECS, ts + DAY_SECS, deadline)
            .await?;

        // An empty series for a past window is the archive's "no data".
        let nearest = points
            .iter()
            .min_by_key(|(point_ts, _)| (point_ts - ts).abs())
            .ok_or(ProviderError::NotFound)?;
        if (nearest.0 - ts).abs() > NEAREST_POINT_MAX_SKEW_SECS {
            return Err(ProviderError::NotFound);
        }
        Ok(nearest.1)
    }
}

#[async_trait]
impl OhlcSource for CoinGeckoClient {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn daily_ohlc(
        &self,
        query: &ProviderQuery,
        from: i64,
        until: i64,
        deadline: Instant,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        let points = self.fetch_range(query, from, until, deadline).await?;
        if points.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(bucket_daily(&points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_daily_folds_intraday_points() {
        let day = day_bucket(1_700_000_000);
        let points = vec![
            (day + 100, 10.0),
            (day + 7_200, 14.0),
            (day + 50_000, 9.0),
            (day + DAY_SECS + 10, 11.0),
            (day + DAY_SECS + 20, 12.5),
        ];
        let bars = bucket_daily(&points);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, 10.0);
        assert_eq!(bars[0].high, 14.0);
        assert_eq!(bars[0].low, 9.0);
        assert_eq!(bars[0].close, 9.0);
        assert_eq!(bars[1].day_ts, day + DAY_SECS);
        assert_eq!(bars[1].close, 12.5);
    }

    #[test]
    fn test_market_chart_payload_decodes() {
        let raw = r#"{"prices":[[1700000000000,3500.5],[1700086400000,3600.0]],
            "market_caps":[],"total_volumes":[]}"#;
        let parsed: MarketChartResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.prices.len(), 2);
        assert_eq!(parsed.prices[0].1, 3500.5);
    }

    #[test]
    fn test_chart_path_prefers_archive_id() {
        let query = ProviderQuery {
            chain: crate::models::Chain::Evm,
            address: Some("0xabc".into()),
            symbol: Some("ETH".into()),
            archive_id: Some("ethereum".into()),
        };
        let path = CoinGeckoClient::chart_path(&query).unwrap();
        assert!(path.ends_with("/coins/ethereum/market_chart/range"));

        let contract_query = ProviderQuery {
            archive_id: None,
            ..query
        };
        let path = CoinGeckoClient::chart_path(&contract_query).unwrap();
        assert!(path.contains("/coins/ethereum/contract/0xabc/"));
    }
}
