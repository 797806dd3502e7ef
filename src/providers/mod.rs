//! Upstream price providers.
//!
//! Each provider gets exactly one `RateLimitedFetcher` and exposes only the
//! query shapes it genuinely supports, through the narrow source traits
//! below. The price service composes providers into fallback chains typed by
//! what is asked, never by where the data happens to live.

pub mod coingecko;
pub mod cryptocompare;
pub mod dexscreener;
pub mod explorer;
pub mod fetcher;
pub mod geckoterminal;

pub use fetcher::{ProviderError, RateLimitedFetcher};

use crate::models::{Chain, DailyBar, PriceReading};
use async_trait::async_trait;
use std::time::Instant;

/// Provider-ready identifiers for one token, produced by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderQuery {
    pub chain: Chain,
    pub address: Option<String>,
    /// Canonical symbol (wrapped-native aliases already folded).
    pub symbol: Option<String>,
    /// Generalist-index id for major assets (e.g. `"ethereum"`), when known.
    pub archive_id: Option<String>,
}

/// Live spot price.
#[async_trait]
pub trait SpotPriceSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn current_price(
        &self,
        query: &ProviderQuery,
        deadline: Instant,
    ) -> Result<PriceReading, ProviderError>;
}

/// Price at an arbitrary past timestamp.
#[async_trait]
pub trait HistoricalPriceSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn price_at(
        &self,
        query: &ProviderQuery,
        ts: i64,
        deadline: Instant,
    ) -> Result<f64, ProviderError>;
}

/// Forward daily OHLC bars over `[from, until]`.
#[async_trait]
pub trait OhlcSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn daily_ohlc(
        &self,
        query: &ProviderQuery,
        from: i64,
        until: i64,
        deadline: Instant,
    ) -> Result<Vec<DailyBar>, ProviderError>;
}

/// Token metadata without price (on-chain explorer role).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMeta {
    pub symbol: Option<String>,
    pub name: Option<String>,
}

#[async_trait]
pub trait TokenMetadataSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn token_metadata(
        &self,
        query: &ProviderQuery,
        deadline: Instant,
    ) -> Result<TokenMeta, ProviderError>;
}
