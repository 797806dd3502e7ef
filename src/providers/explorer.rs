//! On-chain explorer client: token metadata only, never a price.
//!
//! Last hop of the address/chain spot chain: confirms a token exists and
//! yields its symbol when both DEX sources come up empty.

use crate::config::ProviderConfig;
use crate::price::resolver;
use crate::providers::{
    ProviderError, ProviderQuery, RateLimitedFetcher, TokenMeta, TokenMetadataSource,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

pub struct ExplorerClient {
    fetcher: RateLimitedFetcher,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenInfo {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    token_name: Option<String>,
}

impl ExplorerClient {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            fetcher: RateLimitedFetcher::new(
                "explorer",
                config.budget_per_minute(),
                config.timeout(),
            ),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl TokenMetadataSource for ExplorerClient {
    fn name(&self) -> &'static str {
        "explorer"
    }

    async fn token_metadata(
        &self,
        query: &ProviderQuery,
        deadline: Instant,
    ) -> Result<TokenMeta, ProviderError> {
        let address = query.address.as_deref().ok_or(ProviderError::NotFound)?;
        let base = resolver::explorer_api_base(query.chain).ok_or(ProviderError::NotFound)?;

        let mut params = vec![
            ("module", "token".to_string()),
            ("action", "tokeninfo".to_string()),
            ("contractaddress", address.to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("apikey", key.clone()));
        }

        let response: ExplorerResponse =
            self.fetcher.get_json(base, &params, &[], deadline).await?;

        // Explorers report "0" status both for missing tokens and for auth
        // problems; an empty result array means the token is unknown.
        if response.status != "1" {
            return Err(ProviderError::NotFound);
        }

        let infos: Vec<TokenInfo> = response
            .result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProviderError::Parse(e.to_string()))?
            .unwrap_or_default();

        let info = infos.into_iter().next().ok_or(ProviderError::NotFound)?;
        Ok(TokenMeta {
            symbol: info.symbol.map(|s| s.to_uppercase()),
            name: info.token_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokeninfo_payload_decodes() {
        let raw = r#"{"status":"1","message":"OK","result":[
            {"contractAddress":"0xabc","tokenName":"Pepe Coin","symbol":"pepe",
             "divisor":"18","tokenType":"ERC-20"}]}"#;
        let parsed: ExplorerResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "1");
        let infos: Vec<TokenInfo> = serde_json::from_value(parsed.result.unwrap()).unwrap();
        assert_eq!(infos[0].symbol.as_deref(), Some("pepe"));
        assert_eq!(infos[0].token_name.as_deref(), Some("Pepe Coin"));
    }

    #[test]
    fn test_error_status_decodes() {
        let raw = r#"{"status":"0","message":"NOTOK","result":"Invalid contract address"}"#;
        let parsed: ExplorerResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "0");
    }
}
