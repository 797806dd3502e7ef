//! Price data service: typed provider fallback chains plus the persistent
//! daily-bucket cache.
//!
//! Fallback is chosen by what is asked (spot by address, spot by symbol,
//! price at a past timestamp, forward daily OHLC), never by which provider
//! happens to be healthy. Cache hits return without touching the network or
//! any rate limiter.

pub mod cache;
pub mod resolver;

pub use cache::{PriceCache, PricePoint};
pub use resolver::{ResolveError, ResolvedToken, Resolver};

use crate::config::{Config, ProviderName};
use crate::models::{Checkpoint, CheckpointSchedule, OhlcSeries, PriceReading};
use crate::providers::{
    coingecko::CoinGeckoClient, cryptocompare::CryptoCompareClient,
    dexscreener::DexScreenerClient, explorer::ExplorerClient,
    geckoterminal::GeckoTerminalClient, HistoricalPriceSource, OhlcSource, ProviderError,
    SpotPriceSource, TokenMetadataSource,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How stale a current-price source may be and still answer a
/// past-timestamp query.
pub const RECENT_TOLERANCE_SECS: i64 = 15 * 60;

const OP_TIMEOUT: Duration = Duration::from_secs(10);
const WINDOW_TIMEOUT: Duration = Duration::from_secs(30);

/// Price-level failures surfaced to orchestrators. Provider errors never
/// escape the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// No source could answer; the token may still be alive.
    PriceUnavailable,
    /// Every source in the chain failed outright.
    ProviderAllFailed,
    /// The historical archives explicitly reported "no data".
    DeadToken,
    /// A provider budget is exhausted; the batch should pause.
    RateBudgetExhausted,
}

impl std::fmt::Display for PriceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceUnavailable => write!(f, "price unavailable"),
            Self::ProviderAllFailed => write!(f, "all providers failed"),
            Self::DeadToken => write!(f, "token has no historical data (dead)"),
            Self::RateBudgetExhausted => write!(f, "provider rate budget exhausted"),
        }
    }
}

impl std::error::Error for PriceError {}

/// Ordered provider chains per query shape, filtered by what is configured.
#[derive(Default)]
pub struct ProviderRegistry {
    pub address_spot: Vec<Arc<dyn SpotPriceSource>>,
    pub symbol_spot: Vec<Arc<dyn SpotPriceSource>>,
    pub historical: Vec<Arc<dyn HistoricalPriceSource>>,
    pub ohlc: Vec<Arc<dyn OhlcSource>>,
    pub metadata: Vec<Arc<dyn TokenMetadataSource>>,
}

impl ProviderRegistry {
    /// Wire the concrete clients for every configured provider.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = ProviderRegistry::default();

        let dexscreener = config
            .provider(ProviderName::Dexscreener)
            .map(|c| Arc::new(DexScreenerClient::new(c)));
        let geckoterminal = config
            .provider(ProviderName::Geckoterminal)
            .map(|c| Arc::new(GeckoTerminalClient::new(c)));
        let coingecko = config
            .provider(ProviderName::Coingecko)
            .map(|c| Arc::new(CoinGeckoClient::new(c)));
        let cryptocompare = config
            .provider(ProviderName::Cryptocompare)
            .map(|c| Arc::new(CryptoCompareClient::new(c)));
        let explorer = config
            .provider(ProviderName::Explorer)
            .map(|c| Arc::new(ExplorerClient::new(c)));

        // Address spot: liquidity-driven sources have the best low-cap
        // coverage, so the DEX aggregator leads.
        if let Some(p) = &dexscreener {
            registry.address_spot.push(p.clone());
        }
        if let Some(p) = &geckoterminal {
            registry.address_spot.push(p.clone());
        }

        // Symbol spot: the generalist index knows tickers; the aggregator's
        // search is the fallback.
        if let Some(p) = &coingecko {
            registry.symbol_spot.push(p.clone());
        }
        if let Some(p) = &dexscreener {
            registry.symbol_spot.push(p.clone());
        }

        // Historical / OHLC: free archive first, premium timeseries second.
        if let Some(p) = &coingecko {
            registry.historical.push(p.clone());
            registry.ohlc.push(p.clone());
        }
        if let Some(p) = &cryptocompare {
            registry.historical.push(p.clone());
            registry.ohlc.push(p.clone());
        }

        if let Some(p) = explorer {
            registry.metadata.push(p);
        }

        registry
    }
}

pub struct PriceDataService {
    resolver: Arc<Resolver>,
    registry: ProviderRegistry,
    cache: Arc<PriceCache>,
    schedule: CheckpointSchedule,
}

impl PriceDataService {
    pub fn new(
        resolver: Arc<Resolver>,
        registry: ProviderRegistry,
        cache: Arc<PriceCache>,
        schedule: CheckpointSchedule,
    ) -> Self {
        Self {
            resolver,
            registry,
            cache,
            schedule,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resolver = Arc::new(Resolver::from_files(
            config.wrapped_native_aliases.as_deref(),
            config.ambiguous_symbol_blocklist.as_deref(),
        )?);
        let cache = Arc::new(PriceCache::new(config.price_cache_dir()));
        cache.load()?;
        Ok(Self::new(
            resolver,
            ProviderRegistry::from_config(config),
            cache,
            config.schedule.clone(),
        ))
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    /// The subset of checkpoints elapsed as of `now`. Pure, no I/O.
    pub fn calculate_smart_checkpoints(&self, entry_time: i64, now: i64) -> Vec<Checkpoint> {
        self.schedule.elapsed(entry_time, now)
    }

    /// Current price for a resolved token, through the spot chain for the
    /// identifier shape it carries.
    pub async fn get_current(&self, token: &ResolvedToken) -> Result<PriceReading, PriceError> {
        if let Some(reading) = self.cache.get_current(&token.token_key) {
            return Ok(reading);
        }

        let deadline = Instant::now() + OP_TIMEOUT;
        let chain: &[Arc<dyn SpotPriceSource>] = if token.query.address.is_some() {
            &self.registry.address_spot
        } else {
            &self.registry.symbol_spot
        };

        let mut failures = Vec::new();
        for provider in chain {
            match provider.current_price(&token.query, deadline).await {
                Ok(reading) => {
                    self.cache.put_current(&token.token_key, reading.clone());
                    // Today's spot is also a valid historical point.
                    let now = Utc::now().timestamp();
                    self.cache
                        .insert(&token.token_key, now, reading.price, reading.source, now);
                    return Ok(reading);
                }
                Err(e) => {
                    debug!(provider = provider.name(), token = %token.token_key, error = %e, "spot source failed");
                    failures.push(e);
                }
            }
        }

        // Explorer hop: metadata only, never a price. Confirms existence and
        // surfaces the symbol before we report the miss.
        if token.query.address.is_some() {
            for provider in &self.registry.metadata {
                if let Ok(meta) = provider.token_metadata(&token.query, deadline).await {
                    info!(
                        token = %token.token_key,
                        symbol = meta.symbol.as_deref().unwrap_or("?"),
                        "token exists on-chain but no source priced it"
                    );
                    break;
                }
            }
        }

        Err(classify(&failures, false))
    }

    /// Price at a past timestamp: cache, then the historical archives, then
    /// the spot chain when `ts` is within the recency tolerance.
    pub async fn get_at(&self, token: &ResolvedToken, ts: i64, now: i64) -> Result<f64, PriceError> {
        if let Some(price) = self.cache.get(&token.token_key, ts) {
            return Ok(price);
        }

        let deadline = Instant::now() + OP_TIMEOUT;
        let mut failures = Vec::new();
        for provider in &self.registry.historical {
            match provider.price_at(&token.query, ts, deadline).await {
                Ok(price) => {
                    self.cache
                        .insert(&token.token_key, ts, price, provider.name(), now);
                    return Ok(price);
                }
                Err(e) => {
                    debug!(provider = provider.name(), token = %token.token_key, ts, error = %e, "historical source failed");
                    failures.push(e);
                }
            }
        }

        // Spot sources only answer "the price now"; accept that for a very
        // recent timestamp, reject otherwise.
        if now - ts <= RECENT_TOLERANCE_SECS {
            if let Ok(reading) = self.get_current(token).await {
                self.cache
                    .insert(&token.token_key, ts, reading.price, reading.source, now);
                return Ok(reading.price);
            }
        }

        Err(classify(&failures, true))
    }

    /// Forward daily OHLC covering `[entry_time, until]`, with the window
    /// ATH derived from the bars' highs. Bar closes feed the daily cache.
    pub async fn get_forward_window(
        &self,
        token: &ResolvedToken,
        entry_time: i64,
        until: i64,
    ) -> Result<OhlcSeries, PriceError> {
        let deadline = Instant::now() + WINDOW_TIMEOUT;
        let now = Utc::now().timestamp();

        let mut failures = Vec::new();
        for provider in &self.registry.ohlc {
            match provider
                .daily_ohlc(&token.query, entry_time, until, deadline)
                .await
            {
                Ok(bars) => {
                    for bar in &bars {
                        self.cache.insert(
                            &token.token_key,
                            bar.day_ts,
                            bar.close,
                            provider.name(),
                            now,
                        );
                    }
                    debug!(token = %token.token_key, bars = bars.len(), "forward window fetched");
                    return Ok(OhlcSeries::from_bars(bars, entry_time));
                }
                Err(e) => {
                    warn!(provider = provider.name(), token = %token.token_key, error = %e, "ohlc source failed");
                    failures.push(e);
                }
            }
        }

        Err(classify(&failures, true))
    }
}

/// Collapse a chain's provider failures into one price-level error.
fn classify(failures: &[ProviderError], historical: bool) -> PriceError {
    if failures.is_empty() {
        return PriceError::PriceUnavailable;
    }
    if failures
        .iter()
        .any(|e| matches!(e, ProviderError::RateLimited { .. }))
    {
        return PriceError::RateBudgetExhausted;
    }
    if failures
        .iter()
        .all(|e| matches!(e, ProviderError::NotFound))
    {
        return if historical {
            PriceError::DeadToken
        } else {
            PriceError::PriceUnavailable
        };
    }
    PriceError::ProviderAllFailed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_all_not_found_historical_is_dead_token() {
        let failures = vec![ProviderError::NotFound, ProviderError::NotFound];
        assert_eq!(classify(&failures, true), PriceError::DeadToken);
        assert_eq!(classify(&failures, false), PriceError::PriceUnavailable);
    }

    #[test]
    fn test_classify_rate_limited_wins() {
        let failures = vec![
            ProviderError::NotFound,
            ProviderError::RateLimited { retry_after: None },
        ];
        assert_eq!(classify(&failures, true), PriceError::RateBudgetExhausted);
    }

    #[test]
    fn test_classify_mixed_failures() {
        let failures = vec![
            ProviderError::NotFound,
            ProviderError::Transport("boom".into()),
        ];
        assert_eq!(classify(&failures, true), PriceError::ProviderAllFailed);
    }

    #[test]
    fn test_classify_empty_chain() {
        assert_eq!(classify(&[], false), PriceError::PriceUnavailable);
    }
}
