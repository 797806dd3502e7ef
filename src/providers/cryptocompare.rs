//! CryptoCompare client: premium symbol-keyed timeseries.
//!
//! Second hop behind the free archive for historical queries. Needs an API
//! key and a canonical symbol; address-only tokens never reach this client.

use crate::config::ProviderConfig;
use crate::models::{day_bucket, DailyBar, DAY_SECS};
use crate::providers::{
    HistoricalPriceSource, OhlcSource, ProviderError, ProviderQuery, RateLimitedFetcher,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

const API_BASE: &str = "https://min-api.cryptocompare.com/data";

pub struct CryptoCompareClient {
    fetcher: RateLimitedFetcher,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoDayResponse {
    #[serde(rename = "Response", default)]
    response: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Data", default)]
    data: Option<HistoDayData>,
}

#[derive(Debug, Deserialize)]
struct HistoDayData {
    #[serde(rename = "Data", default)]
    bars: Vec<HistoDayBar>,
}

#[derive(Debug, Deserialize)]
struct HistoDayBar {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl CryptoCompareClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            fetcher: RateLimitedFetcher::new(
                "cryptocompare",
                config.budget_per_minute(),
                config.timeout(),
            ),
            api_key: config.api_key.clone(),
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        match &self.api_key {
            Some(key) => vec![("authorization", format!("Apikey {}", key))],
            None => Vec::new(),
        }
    }

    fn symbol_of(query: &ProviderQuery) -> Result<&str, ProviderError> {
        query.symbol.as_deref().ok_or(ProviderError::NotFound)
    }
}

#[async_trait]
impl HistoricalPriceSource for CryptoCompareClient {
    fn name(&self) -> &'static str {
        "cryptocompare"
    }

    async fn price_at(
        &self,
        query: &ProviderQuery,
        ts: i64,
        deadline: Instant,
    ) -> Result<f64, ProviderError> {
        let symbol = Self::symbol_of(query)?;

        let url = format!("{}/pricehistorical", API_BASE);
        let params = [
            ("fsym", symbol.to_string()),
            ("tsyms", "USD".to_string()),
            ("ts", ts.to_string()),
        ];
        // Shape: {"ETH": {"USD": 1234.5}}, or {"Response":"Error", ...}.
        let response: serde_json::Value = self
            .fetcher
            .get_json(&url, &params, &self.headers(), deadline)
            .await?;

        if response.get("Response").and_then(|v| v.as_str()) == Some("Error") {
            return Err(ProviderError::NotFound);
        }

        let price = response
            .get(symbol)
            .and_then(|v| v.get("USD"))
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ProviderError::Parse("missing fsym/USD entry".into()))?;

        // CryptoCompare reports unknown symbols as price 0 rather than erroring.
        if !price.is_finite() || price <= 0.0 {
            return Err(ProviderError::NotFound);
        }
        Ok(price)
    }
}

#[async_trait]
impl OhlcSource for CryptoCompareClient {
    fn name(&self) -> &'static str {
        "cryptocompare"
    }

    async fn daily_ohlc(
        &self,
        query: &ProviderQuery,
        from: i64,
        until: i64,
        deadline: Instant,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        let symbol = Self::symbol_of(query)?;
        let days = ((until - from) / DAY_SECS + 1).clamp(1, 2000);

        let url = format!("{}/v2/histoday", API_BASE);
        let params = [
            ("fsym", symbol.to_string()),
            ("tsym", "USD".to_string()),
            ("toTs", until.to_string()),
            ("limit", days.to_string()),
        ];
        let response: HistoDayResponse = self
            .fetcher
            .get_json(&url, &params, &self.headers(), deadline)
            .await?;

        if response.response.as_deref() == Some("Error") {
            return Err(ProviderError::Parse(
                response.message.unwrap_or_else(|| "histoday error".into()),
            ));
        }

        let bars: Vec<DailyBar> = response
            .data
            .map(|d| d.bars)
            .unwrap_or_default()
            .into_iter()
            .filter(|b| b.time >= day_bucket(from) && b.time <= until)
            // All-zero bars are CryptoCompare's "no data for this day".
            .filter(|b| b.close > 0.0 && b.high > 0.0)
            .map(|b| DailyBar {
                day_ts: day_bucket(b.time),
                open: b.open,
                high: b.high,
                low: b.low,
                close: b.close,
            })
            .collect();

        if bars.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(bars)
    }
}
