//! Runtime configuration.
//!
//! Sources, in precedence order: built-in defaults, the optional TOML config
//! file (`--config` / `CONFIG_PATH`), then environment overrides for the
//! enumerated option names. Unknown keys in the config file are rejected at
//! startup (`deny_unknown_fields`); a malformed value anywhere is fatal.

use crate::models::{Checkpoint, CheckpointSchedule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;
pub const DEFAULT_LIVE_CYCLE_SECS: u64 = 2 * 3600;
pub const DEFAULT_TD_ALPHA: f64 = 0.1;
pub const DEFAULT_WINNER_ATH_THRESHOLD: f64 = 2.0;
pub const DEFAULT_MIN_SIGNALS_FOR_REPUTATION: u32 = 5;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {}", e),
            Self::Parse(msg) => write!(f, "config parse error: {}", msg),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Which upstream a provider entry configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Dexscreener,
    Geckoterminal,
    Explorer,
    Coingecko,
    Cryptocompare,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Dexscreener => "dexscreener",
            ProviderName::Geckoterminal => "geckoterminal",
            ProviderName::Explorer => "explorer",
            ProviderName::Coingecko => "coingecko",
            ProviderName::Cryptocompare => "cryptocompare",
        }
    }
}

/// Per-provider settings: API key, documented rate budget, request timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: ProviderName,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Documented per-minute budget. The token bucket is sized to 90 % of it.
    #[serde(default)]
    pub rate_per_minute: Option<f64>,
    /// Documented per-day budget, for providers quoted that way.
    #[serde(default)]
    pub rate_per_day: Option<f64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

impl ProviderConfig {
    pub fn new(name: ProviderName, rate_per_minute: f64) -> Self {
        Self {
            name,
            api_key: None,
            rate_per_minute: Some(rate_per_minute),
            rate_per_day: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Effective per-minute budget (per-day budgets spread evenly).
    pub fn budget_per_minute(&self) -> f64 {
        if let Some(m) = self.rate_per_minute {
            m
        } else if let Some(d) = self.rate_per_day {
            d / (24.0 * 60.0)
        } else {
            60.0
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new(ProviderName::Dexscreener, 300.0),
        ProviderConfig::new(ProviderName::Geckoterminal, 30.0),
        ProviderConfig::new(ProviderName::Coingecko, 30.0),
        ProviderConfig::new(ProviderName::Cryptocompare, 100.0),
        ProviderConfig::new(ProviderName::Explorer, 5.0),
    ]
}

/// On-disk config shape. Every recognized option; nothing else.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    providers: Option<Vec<ProviderConfig>>,
    /// Override of checkpoint offsets (seconds), keyed by checkpoint label.
    checkpoint_offsets: Option<BTreeMap<Checkpoint, i64>>,
    worker_pool_size: Option<usize>,
    live_cycle_period_secs: Option<u64>,
    td_alpha: Option<f64>,
    winner_ath_threshold: Option<f64>,
    min_signals_for_reputation: Option<u32>,
    ambiguous_symbol_blocklist: Option<PathBuf>,
    wrapped_native_aliases: Option<PathBuf>,
}

/// Resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub providers: Vec<ProviderConfig>,
    pub schedule: CheckpointSchedule,
    pub worker_pool_size: usize,
    pub live_cycle_period: Duration,
    pub td_alpha: f64,
    pub winner_ath_threshold: f64,
    pub min_signals_for_reputation: u32,
    pub ambiguous_symbol_blocklist: Option<PathBuf>,
    pub wrapped_native_aliases: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            providers: default_providers(),
            schedule: CheckpointSchedule::default(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            live_cycle_period: Duration::from_secs(DEFAULT_LIVE_CYCLE_SECS),
            td_alpha: DEFAULT_TD_ALPHA,
            winner_ath_threshold: DEFAULT_WINNER_ATH_THRESHOLD,
            min_signals_for_reputation: DEFAULT_MIN_SIGNALS_FOR_REPUTATION,
            ambiguous_symbol_blocklist: None,
            wrapped_native_aliases: None,
        }
    }
}

impl Config {
    /// Load from the optional config file, then apply environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut cfg = Config::default();

        let file_path = config_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from));

        if let Some(path) = file_path {
            let raw = std::fs::read_to_string(&path)?;
            let file: ConfigFile =
                toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
            cfg.apply_file(file);
        }

        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(dir) = file.data_dir {
            self.data_dir = dir;
        }
        if let Some(providers) = file.providers {
            self.providers = providers;
        }
        if let Some(offsets) = file.checkpoint_offsets {
            for (checkpoint, secs) in offsets {
                self.schedule.offsets.insert(checkpoint, secs);
            }
        }
        if let Some(v) = file.worker_pool_size {
            self.worker_pool_size = v;
        }
        if let Some(v) = file.live_cycle_period_secs {
            self.live_cycle_period = Duration::from_secs(v);
        }
        if let Some(v) = file.td_alpha {
            self.td_alpha = v;
        }
        if let Some(v) = file.winner_ath_threshold {
            self.winner_ath_threshold = v;
        }
        if let Some(v) = file.min_signals_for_reputation {
            self.min_signals_for_reputation = v;
        }
        if file.ambiguous_symbol_blocklist.is_some() {
            self.ambiguous_symbol_blocklist = file.ambiguous_symbol_blocklist;
        }
        if file.wrapped_native_aliases.is_some() {
            self.wrapped_native_aliases = file.wrapped_native_aliases;
        }
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env::<usize>("WORKER_POOL_SIZE")? {
            self.worker_pool_size = v;
        }
        if let Some(v) = parse_env::<u64>("LIVE_CYCLE_PERIOD")? {
            self.live_cycle_period = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<f64>("TD_ALPHA")? {
            self.td_alpha = v;
        }
        if let Some(v) = parse_env::<f64>("WINNER_ATH_THRESHOLD")? {
            self.winner_ath_threshold = v;
        }
        if let Some(v) = parse_env::<u32>("MIN_SIGNALS_FOR_REPUTATION")? {
            self.min_signals_for_reputation = v;
        }
        if let Ok(path) = std::env::var("AMBIGUOUS_SYMBOL_BLOCKLIST") {
            self.ambiguous_symbol_blocklist = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("WRAPPED_NATIVE_ALIASES") {
            self.wrapped_native_aliases = Some(PathBuf::from(path));
        }
        // Per-provider API keys: <NAME>_API_KEY.
        for provider in &mut self.providers {
            let var = format!("{}_API_KEY", provider.name.as_str().to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                if !key.trim().is_empty() {
                    provider.api_key = Some(key);
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid("WORKER_POOL_SIZE must be > 0".into()));
        }
        if !(self.td_alpha > 0.0 && self.td_alpha <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "TD_ALPHA must be in (0, 1], got {}",
                self.td_alpha
            )));
        }
        if self.winner_ath_threshold <= 1.0 {
            return Err(ConfigError::Invalid(format!(
                "WINNER_ATH_THRESHOLD must be > 1.0, got {}",
                self.winner_ath_threshold
            )));
        }
        if self.live_cycle_period.as_secs() == 0 {
            return Err(ConfigError::Invalid("LIVE_CYCLE_PERIOD must be > 0".into()));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one provider must be configured".into(),
            ));
        }
        for provider in &self.providers {
            if provider.budget_per_minute() <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "provider {} has a non-positive rate budget",
                    provider.name.as_str()
                )));
            }
        }
        let mut prev = 0;
        for checkpoint in Checkpoint::ALL {
            let offset = self.schedule.offset(checkpoint);
            if offset <= prev {
                return Err(ConfigError::Invalid(format!(
                    "checkpoint offsets must be strictly increasing ({} at {}s)",
                    checkpoint.as_str(),
                    offset
                )));
            }
            prev = offset;
        }
        Ok(())
    }

    pub fn provider(&self, name: ProviderName) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn active_tracking_path(&self) -> PathBuf {
        self.data_dir.join("active_tracking.json")
    }

    pub fn completed_history_path(&self) -> PathBuf {
        self.data_dir.join("completed_history.json")
    }

    pub fn bootstrap_progress_path(&self) -> PathBuf {
        self.data_dir.join("bootstrap_progress.json")
    }

    pub fn reputation_dir(&self) -> PathBuf {
        self.data_dir.join("reputation")
    }

    pub fn price_cache_dir(&self) -> PathBuf {
        self.data_dir.join("price_cache")
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{}={:?} is not a valid value", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_config_key_is_rejected() {
        let err = toml::from_str::<ConfigFile>("worker_pool_size = 3\nsurprise = true\n")
            .expect_err("unknown key should fail");
        assert!(err.to_string().contains("surprise"));
    }

    #[test]
    fn test_checkpoint_offsets_override() {
        let file: ConfigFile = toml::from_str(
            r#"
            [checkpoint_offsets]
            "1h" = 60
            "30d" = 1800
            "#,
        )
        .unwrap();
        let mut cfg = Config::default();
        cfg.apply_file(file);
        assert_eq!(cfg.schedule.offset(Checkpoint::H1), 60);
        assert_eq!(cfg.schedule.offset(Checkpoint::D30), 1800);
        // Untouched entries keep their defaults.
        assert_eq!(cfg.schedule.offset(Checkpoint::D7), 7 * 86_400);
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let cfg = Config {
            td_alpha: 1.5,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_provider_budget_per_day_spread() {
        let provider = ProviderConfig {
            name: ProviderName::Cryptocompare,
            api_key: None,
            rate_per_minute: None,
            rate_per_day: Some(2880.0),
            timeout_secs: 10,
        };
        assert!((provider.budget_per_minute() - 2.0).abs() < 1e-9);
    }
}
