//! DexScreener client: DEX aggregator spot prices.
//!
//! Best coverage for low-cap tokens because pricing is liquidity-driven.
//! No API key; generous public budget. Spot only, so it also backs the
//! recent-past tolerance path in the price service.

use crate::config::ProviderConfig;
use crate::models::{Chain, PriceReading};
use crate::price::resolver;
use crate::providers::{ProviderError, ProviderQuery, RateLimitedFetcher, SpotPriceSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;
use tracing::debug;

const API_BASE: &str = "https://api.dexscreener.com/latest/dex";

pub struct DexScreenerClient {
    fetcher: RateLimitedFetcher,
}

#[derive(Debug, Deserialize)]
struct TokenPairsResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    chain_id: String,
    #[serde(default)]
    price_usd: Option<String>,
    #[serde(default)]
    liquidity: Option<Liquidity>,
    #[serde(default)]
    fdv: Option<f64>,
    #[serde(default)]
    volume: Option<Volume>,
    base_token: BaseToken,
}

#[derive(Debug, Deserialize)]
struct Liquidity {
    #[serde(default)]
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Volume {
    #[serde(default)]
    h24: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BaseToken {
    address: String,
    #[serde(default)]
    symbol: Option<String>,
}

impl DexScreenerClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            fetcher: RateLimitedFetcher::new(
                "dexscreener",
                config.budget_per_minute(),
                config.timeout(),
            ),
        }
    }

    /// Pick the deepest pair for the requested token on the requested chain.
    fn best_pair(pairs: Vec<Pair>, chain: Chain, address: &str) -> Option<Pair> {
        let chain_slug = resolver::dexscreener_chain(chain)?;
        let address = address.to_lowercase();
        pairs
            .into_iter()
            .filter(|p| {
                p.chain_id == chain_slug && p.base_token.address.to_lowercase() == address
            })
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Deepest pair whose base token carries the requested ticker, any chain.
    /// Used on the symbol fallback path where no address is known.
    fn best_pair_by_symbol(pairs: Vec<Pair>, symbol: &str) -> Option<Pair> {
        let symbol = symbol.to_uppercase();
        pairs
            .into_iter()
            .filter(|p| {
                p.base_token
                    .symbol
                    .as_deref()
                    .is_some_and(|s| s.to_uppercase() == symbol)
            })
            .max_by(|a, b| {
                let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    fn reading_from_pair(&self, pair: Pair) -> Result<PriceReading, ProviderError> {
        let price = pair
            .price_usd
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| ProviderError::Parse("pair missing priceUsd".into()))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(ProviderError::Parse(format!("non-positive price {}", price)));
        }

        Ok(PriceReading {
            price,
            market_cap: pair.fdv,
            liquidity: pair.liquidity.and_then(|l| l.usd),
            volume_24h: pair.volume.and_then(|v| v.h24),
            symbol_resolved: pair.base_token.symbol,
            source: "dexscreener",
        })
    }
}

#[async_trait]
impl SpotPriceSource for DexScreenerClient {
    fn name(&self) -> &'static str {
        "dexscreener"
    }

    async fn current_price(
        &self,
        query: &ProviderQuery,
        deadline: Instant,
    ) -> Result<PriceReading, ProviderError> {
        if let Some(address) = query.address.as_deref() {
            let url = format!("{}/tokens/{}", API_BASE, address);
            let response: TokenPairsResponse =
                self.fetcher.get_json(&url, &[], &[], deadline).await?;

            let pairs = response.pairs.unwrap_or_default();
            debug!(
                token = address,
                pairs = pairs.len(),
                "dexscreener pairs fetched"
            );

            let pair =
                Self::best_pair(pairs, query.chain, address).ok_or(ProviderError::NotFound)?;
            return self.reading_from_pair(pair);
        }

        let symbol = query.symbol.as_deref().ok_or(ProviderError::NotFound)?;
        let url = format!("{}/search", API_BASE);
        let response: TokenPairsResponse = self
            .fetcher
            .get_json(&url, &[("q", symbol.to_string())], &[], deadline)
            .await?;

        let pair = Self::best_pair_by_symbol(response.pairs.unwrap_or_default(), symbol)
            .ok_or(ProviderError::NotFound)?;
        self.reading_from_pair(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(chain: &str, address: &str, liquidity: f64, price: &str) -> Pair {
        Pair {
            chain_id: chain.to_string(),
            price_usd: Some(price.to_string()),
            liquidity: Some(Liquidity {
                usd: Some(liquidity),
            }),
            fdv: None,
            volume: None,
            base_token: BaseToken {
                address: address.to_string(),
                symbol: Some("TKN".to_string()),
            },
        }
    }

    #[test]
    fn test_best_pair_prefers_deepest_on_chain() {
        let pairs = vec![
            pair("bsc", "0xaaa", 900_000.0, "1.0"),
            pair("ethereum", "0xaaa", 50_000.0, "1.1"),
            pair("ethereum", "0xaaa", 700_000.0, "1.2"),
            pair("ethereum", "0xbbb", 5_000_000.0, "9.9"),
        ];
        let best = DexScreenerClient::best_pair(pairs, Chain::Evm, "0xAAA").unwrap();
        assert_eq!(best.price_usd.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_best_pair_by_symbol_matches_ticker_case_insensitively() {
        let mut a = pair("ethereum", "0xaaa", 100.0, "1.0");
        a.base_token.symbol = Some("wagmi".to_string());
        let mut b = pair("bsc", "0xbbb", 900.0, "2.0");
        b.base_token.symbol = Some("WAGMI".to_string());
        let c = pair("ethereum", "0xccc", 5_000.0, "3.0");

        let best = DexScreenerClient::best_pair_by_symbol(vec![a, b, c], "Wagmi").unwrap();
        assert_eq!(best.price_usd.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_best_pair_none_for_unlisted_token() {
        let pairs = vec![pair("ethereum", "0xbbb", 1000.0, "1.0")];
        assert!(DexScreenerClient::best_pair(pairs, Chain::Evm, "0xaaa").is_none());
    }

    #[test]
    fn test_pairs_payload_decodes() {
        let raw = r#"{"schemaVersion":"1.0.0","pairs":[{"chainId":"ethereum",
            "priceUsd":"1.23","liquidity":{"usd":150000.5},"fdv":9000000,
            "volume":{"h24":12345.0},
            "baseToken":{"address":"0xAbC","symbol":"PEPE"}}]}"#;
        let parsed: TokenPairsResponse = serde_json::from_str(raw).unwrap();
        let pairs = parsed.pairs.unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].base_token.symbol.as_deref(), Some("PEPE"));
    }
}
