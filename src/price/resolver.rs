//! Symbol/address resolution.
//!
//! Pure and synchronous: folds wrapped-native aliases to their canonical
//! asset, refuses ambiguous ticker symbols without an explicit prefix marker,
//! and spells chain names the way each provider expects them. Built-in
//! tables cover the majors; both tables can be replaced from config files.

use crate::models::{Chain, TokenRef};
use crate::providers::ProviderQuery;
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Symbol is a common English word and the message carried no `$`/`#`.
    AmbiguousSymbol(String),
    /// Neither an address nor a symbol was present.
    MissingIdentifiers,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousSymbol(s) => {
                write!(f, "ambiguous symbol {} requires an explicit prefix", s)
            }
            Self::MissingIdentifiers => write!(f, "token ref has neither address nor symbol"),
        }
    }
}

impl std::error::Error for ResolveError {}

lazy_static! {
    /// Wrapped-native spellings (lower-cased) → canonical symbol.
    static ref WRAPPED_NATIVE: HashMap<&'static str, &'static str> = HashMap::from([
        ("weth", "ETH"),
        ("wrapped ether", "ETH"),
        ("wrapped eth", "ETH"),
        ("wbnb", "BNB"),
        ("wrapped bnb", "BNB"),
        ("wsol", "SOL"),
        ("wrapped sol", "SOL"),
        ("wmatic", "MATIC"),
        ("wrapped matic", "MATIC"),
        ("wavax", "AVAX"),
        ("wrapped avax", "AVAX"),
        ("wbtc", "BTC"),
        ("wrapped bitcoin", "BTC"),
    ]);

    /// Canonical wrapped-native contract addresses → canonical symbol.
    static ref WRAPPED_NATIVE_ADDRESSES: HashMap<&'static str, &'static str> = HashMap::from([
        // WETH mainnet / arbitrum / base
        ("0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "ETH"),
        ("0x82af49447d8a07e3bd95bd0d56f35241523fbab1", "ETH"),
        ("0x4200000000000000000000000000000000000006", "ETH"),
        // WBNB, WMATIC, WAVAX, WSOL
        ("0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c", "BNB"),
        ("0x0d500b1d8e8ef31e21c99d1db9a6444d3adf1270", "MATIC"),
        ("0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7", "AVAX"),
        ("so11111111111111111111111111111111111111112", "SOL"),
    ]);

    /// Ticker symbols that are common English words. `true` means the
    /// extractor must have seen a `$`/`#` prefix for the symbol to resolve.
    static ref AMBIGUOUS_SYMBOLS: HashMap<&'static str, bool> = HashMap::from([
        ("ONE", true),
        ("LINK", true),
        ("NEAR", true),
        ("FLOW", true),
        ("APE", true),
        ("SAND", true),
        ("GAS", true),
        ("OP", true),
        ("SUN", true),
        ("MOON", true),
        ("HOT", true),
        ("WIN", true),
        ("TIME", true),
        ("CAKE", true),
        ("PEOPLE", true),
        ("T", true),
    ]);

    /// Canonical symbol → generalist-index (archive) id.
    static ref ARCHIVE_IDS: HashMap<&'static str, &'static str> = HashMap::from([
        ("BTC", "bitcoin"),
        ("ETH", "ethereum"),
        ("SOL", "solana"),
        ("BNB", "binancecoin"),
        ("MATIC", "matic-network"),
        ("AVAX", "avalanche-2"),
        ("ARB", "arbitrum"),
        ("OP", "optimism"),
        ("LINK", "chainlink"),
        ("UNI", "uniswap"),
        ("AAVE", "aave"),
        ("DOGE", "dogecoin"),
        ("PEPE", "pepe"),
        ("NEAR", "near"),
        ("APE", "apecoin"),
        ("SAND", "the-sandbox"),
        ("FLOW", "flow"),
        ("ONE", "harmony"),
    ]);
}

/// Chain spelling for DexScreener's `chainId` field.
pub fn dexscreener_chain(chain: Chain) -> Option<&'static str> {
    Some(match chain {
        Chain::Evm => "ethereum",
        Chain::Arbitrum => "arbitrum",
        Chain::Base => "base",
        Chain::Bsc => "bsc",
        Chain::Polygon => "polygon",
        Chain::Avalanche => "avalanche",
        Chain::Solana => "solana",
    })
}

/// Chain spelling for GeckoTerminal network paths.
pub fn geckoterminal_network(chain: Chain) -> Option<&'static str> {
    Some(match chain {
        Chain::Evm => "eth",
        Chain::Arbitrum => "arbitrum",
        Chain::Base => "base",
        Chain::Bsc => "bsc",
        Chain::Polygon => "polygon_pos",
        Chain::Avalanche => "avax",
        Chain::Solana => "solana",
    })
}

/// Chain spelling for the archive's contract platforms.
pub fn coingecko_platform(chain: Chain) -> Option<&'static str> {
    Some(match chain {
        Chain::Evm => "ethereum",
        Chain::Arbitrum => "arbitrum-one",
        Chain::Base => "base",
        Chain::Bsc => "binance-smart-chain",
        Chain::Polygon => "polygon-pos",
        Chain::Avalanche => "avalanche",
        Chain::Solana => "solana",
    })
}

/// Explorer API endpoint per chain; None where no etherscan-family explorer
/// exists.
pub fn explorer_api_base(chain: Chain) -> Option<&'static str> {
    match chain {
        Chain::Evm => Some("https://api.etherscan.io/api"),
        Chain::Arbitrum => Some("https://api.arbiscan.io/api"),
        Chain::Base => Some("https://api.basescan.org/api"),
        Chain::Bsc => Some("https://api.bscscan.com/api"),
        Chain::Polygon => Some("https://api.polygonscan.com/api"),
        Chain::Avalanche => Some("https://api.snowscan.xyz/api"),
        Chain::Solana => None,
    }
}

/// Shape of the two optional override files.
#[derive(Debug, Default, Deserialize)]
struct AliasFile(HashMap<String, String>);

#[derive(Debug, Default, Deserialize)]
struct BlocklistFile(HashMap<String, bool>);

/// A resolved token: canonical ref, stable key, provider-ready identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedToken {
    pub token_ref: TokenRef,
    pub token_key: String,
    pub query: ProviderQuery,
}

pub struct Resolver {
    wrapped_aliases: HashMap<String, String>,
    wrapped_addresses: HashMap<String, String>,
    blocklist: HashMap<String, bool>,
    archive_ids: HashMap<String, String>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self {
            wrapped_aliases: WRAPPED_NATIVE
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            wrapped_addresses: WRAPPED_NATIVE_ADDRESSES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            blocklist: AMBIGUOUS_SYMBOLS
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            archive_ids: ARCHIVE_IDS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl Resolver {
    /// Build with optional override tables loaded from JSON files.
    pub fn from_files(
        aliases_path: Option<&Path>,
        blocklist_path: Option<&Path>,
    ) -> anyhow::Result<Self> {
        let mut resolver = Self::default();

        if let Some(path) = aliases_path {
            let raw = std::fs::read_to_string(path)?;
            let AliasFile(table) = serde_json::from_str(&raw)?;
            info!(path = %path.display(), entries = table.len(), "loaded wrapped-native alias table");
            resolver.wrapped_aliases = table
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v.to_uppercase()))
                .collect();
        }

        if let Some(path) = blocklist_path {
            let raw = std::fs::read_to_string(path)?;
            let BlocklistFile(table) = serde_json::from_str(&raw)?;
            info!(path = %path.display(), entries = table.len(), "loaded ambiguous-symbol blocklist");
            resolver.blocklist = table
                .into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect();
        }

        Ok(resolver)
    }

    /// Fold wrapped-native spellings/addresses to the canonical asset and
    /// normalize case. The returned ref is what `token_key` is derived from.
    pub fn canonicalize(&self, token: &TokenRef) -> TokenRef {
        // A known wrapped-native contract collapses to the bare asset so
        // historical queries hit the canonical timeseries.
        if let Some(address) = &token.address {
            if let Some(canonical) = self.wrapped_addresses.get(&address.to_lowercase()) {
                return TokenRef::from_symbol(token.chain, canonical.clone());
            }
        }

        let mut canonical = token.clone();
        canonical.address = canonical.address.map(|a| a.to_lowercase());
        canonical.symbol = canonical.symbol.map(|s| {
            let folded = self
                .wrapped_aliases
                .get(&s.to_lowercase())
                .cloned()
                .unwrap_or(s);
            folded.to_uppercase()
        });
        canonical
    }

    /// Resolve a token ref into provider-ready identifiers.
    ///
    /// `explicit_prefix` is the extractor's `$`/`#` flag; a blocklisted
    /// symbol without it is refused even when a caller asks directly.
    pub fn resolve(
        &self,
        token: &TokenRef,
        explicit_prefix: bool,
    ) -> Result<ResolvedToken, ResolveError> {
        if token.address.is_none() && token.symbol.is_none() {
            return Err(ResolveError::MissingIdentifiers);
        }

        let canonical = self.canonicalize(token);

        // Only symbol-carried identity can be ambiguous; an address is exact.
        if canonical.address.is_none() {
            if let Some(symbol) = &canonical.symbol {
                if self.blocklist.get(symbol.as_str()).copied().unwrap_or(false)
                    && !explicit_prefix
                {
                    return Err(ResolveError::AmbiguousSymbol(symbol.clone()));
                }
            }
        }

        let archive_id = canonical
            .symbol
            .as_deref()
            .and_then(|s| self.archive_ids.get(s))
            .cloned();

        let token_key = canonical.token_key();
        let query = ProviderQuery {
            chain: canonical.chain,
            address: canonical.address.clone(),
            symbol: canonical.symbol.clone(),
            archive_id,
        };

        Ok(ResolvedToken {
            token_ref: canonical,
            token_key,
            query,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_ether_symbol_folds_to_eth() {
        let resolver = Resolver::default();
        let token = TokenRef::from_symbol(Chain::Evm, "WETH");
        let resolved = resolver.resolve(&token, false).unwrap();
        assert_eq!(resolved.token_key, "ETH");
        assert_eq!(resolved.query.archive_id.as_deref(), Some("ethereum"));
    }

    #[test]
    fn test_wrapped_ether_address_yields_eth_timeseries() {
        let resolver = Resolver::default();
        let token =
            TokenRef::from_address(Chain::Arbitrum, "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1");
        let resolved = resolver.resolve(&token, false).unwrap();
        assert_eq!(resolved.token_key, "ETH");
        assert!(resolved.query.address.is_none());
        assert_eq!(resolved.query.archive_id.as_deref(), Some("ethereum"));
    }

    #[test]
    fn test_ambiguous_symbol_needs_prefix() {
        let resolver = Resolver::default();
        let token = TokenRef::from_symbol(Chain::Evm, "LINK");

        let err = resolver.resolve(&token, false).unwrap_err();
        assert_eq!(err, ResolveError::AmbiguousSymbol("LINK".to_string()));

        let ok = resolver.resolve(&token, true).unwrap();
        assert_eq!(ok.token_key, "LINK");
    }

    #[test]
    fn test_address_bypasses_blocklist() {
        let resolver = Resolver::default();
        let token = TokenRef::from_address(Chain::Evm, "0x514910771af9ca656af840dff83e8264ecf986ca")
            .with_symbol("LINK");
        let resolved = resolver.resolve(&token, false).unwrap();
        assert_eq!(
            resolved.token_key,
            "evm:0x514910771af9ca656af840dff83e8264ecf986ca"
        );
    }

    #[test]
    fn test_empty_ref_is_rejected() {
        let resolver = Resolver::default();
        let token = TokenRef {
            chain: Chain::Evm,
            address: None,
            symbol: None,
        };
        assert_eq!(
            resolver.resolve(&token, true).unwrap_err(),
            ResolveError::MissingIdentifiers
        );
    }
}
