//! GeckoTerminal client: multi-chain DEX index, spot prices by address.
//!
//! Second hop of the address/chain spot chain. Keyless public API.

use crate::config::ProviderConfig;
use crate::models::PriceReading;
use crate::price::resolver;
use crate::providers::{ProviderError, ProviderQuery, RateLimitedFetcher, SpotPriceSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

const API_BASE: &str = "https://api.geckoterminal.com/api/v2";

pub struct GeckoTerminalClient {
    fetcher: RateLimitedFetcher,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    data: TokenData,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    attributes: TokenAttributes,
}

#[derive(Debug, Deserialize)]
struct TokenAttributes {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    price_usd: Option<String>,
    #[serde(default)]
    fdv_usd: Option<String>,
    #[serde(default)]
    total_reserve_in_usd: Option<String>,
    #[serde(default)]
    volume_usd: Option<VolumeUsd>,
}

#[derive(Debug, Deserialize)]
struct VolumeUsd {
    #[serde(default)]
    h24: Option<String>,
}

fn parse_decimal(raw: &Option<String>) -> Option<f64> {
    raw.as_deref().and_then(|s| s.parse::<f64>().ok())
}

impl GeckoTerminalClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            fetcher: RateLimitedFetcher::new(
                "geckoterminal",
                config.budget_per_minute(),
                config.timeout(),
            ),
        }
    }
}

#[async_trait]
impl SpotPriceSource for GeckoTerminalClient {
    fn name(&self) -> &'static str {
        "geckoterminal"
    }

    async fn current_price(
        &self,
        query: &ProviderQuery,
        deadline: Instant,
    ) -> Result<PriceReading, ProviderError> {
        let address = query.address.as_deref().ok_or(ProviderError::NotFound)?;
        let network =
            resolver::geckoterminal_network(query.chain).ok_or(ProviderError::NotFound)?;

        let url = format!("{}/networks/{}/tokens/{}", API_BASE, network, address);
        let response: TokenResponse = self.fetcher.get_json(&url, &[], &[], deadline).await?;
        let attrs = response.data.attributes;

        let price = parse_decimal(&attrs.price_usd)
            .ok_or_else(|| ProviderError::Parse("token missing price_usd".into()))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(ProviderError::Parse(format!(
                "non-positive price {} for {}",
                price, address
            )));
        }

        Ok(PriceReading {
            price,
            market_cap: parse_decimal(&attrs.fdv_usd),
            liquidity: parse_decimal(&attrs.total_reserve_in_usd),
            volume_24h: attrs.volume_usd.and_then(|v| parse_decimal(&v.h24)),
            symbol_resolved: attrs.symbol,
            source: self.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_payload_decodes() {
        let raw = r#"{"data":{"id":"eth_0xabc","type":"token","attributes":{
            "symbol":"WAGMI","price_usd":"0.0123","fdv_usd":"1200000",
            "total_reserve_in_usd":"45000.7","volume_usd":{"h24":"8900.1"}}}}"#;
        let parsed: TokenResponse = serde_json::from_str(raw).unwrap();
        let attrs = parsed.data.attributes;
        assert_eq!(attrs.symbol.as_deref(), Some("WAGMI"));
        assert_eq!(parse_decimal(&attrs.price_usd), Some(0.0123));
        assert_eq!(parse_decimal(&attrs.total_reserve_in_usd), Some(45000.7));
    }

    #[test]
    fn test_parse_decimal_rejects_garbage() {
        assert_eq!(parse_decimal(&Some("not-a-number".into())), None);
        assert_eq!(parse_decimal(&None), None);
    }
}
