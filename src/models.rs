//! Core data model: token references, signals, checkpoints, outcomes.
//!
//! Everything persisted to disk lives here (or in the per-store modules) as
//! plain serde structs. Timestamps are UTC epoch seconds; `chrono` is only
//! used at the edges (inbound ISO-8601, log formatting).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DAY_SECS: i64 = 86_400;

/// Fixed 30-day tracking window.
pub const TRACKING_WINDOW_SECS: i64 = 30 * DAY_SECS;

#[inline]
pub fn day_bucket(ts: i64) -> i64 {
    (ts / DAY_SECS) * DAY_SECS
}

/// Generic chain names used internally. Each provider has its own spelling
/// (resolved in `price::resolver`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Evm,
    Arbitrum,
    Base,
    Bsc,
    Polygon,
    Avalanche,
    Solana,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Evm => "evm",
            Chain::Arbitrum => "arbitrum",
            Chain::Base => "base",
            Chain::Bsc => "bsc",
            Chain::Polygon => "polygon",
            Chain::Avalanche => "avalanche",
            Chain::Solana => "solana",
        }
    }
}

/// A token reference as extracted from a message. Either `address` + chain or
/// `symbol` must be present; both may be. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRef {
    pub chain: Chain,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

impl TokenRef {
    pub fn from_address(chain: Chain, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: Some(address.into().to_lowercase()),
            symbol: None,
        }
    }

    pub fn from_symbol(chain: Chain, symbol: impl Into<String>) -> Self {
        Self {
            chain,
            address: None,
            symbol: Some(symbol.into().to_uppercase()),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into().to_uppercase());
        self
    }

    /// Canonical, provider-independent key: `"<chain>:<address>"` when the
    /// address is known, else the upper-cased symbol. Wrapped-native folding
    /// happens in the resolver before this is called.
    pub fn token_key(&self) -> String {
        match &self.address {
            Some(addr) => format!("{}:{}", self.chain.as_str(), addr.to_lowercase()),
            None => self.symbol.as_deref().unwrap_or_default().to_uppercase(),
        }
    }

    /// Short human label for logs.
    pub fn label(&self) -> String {
        match (&self.symbol, &self.address) {
            (Some(s), _) => s.clone(),
            (None, Some(a)) => format!("{}…", &a[..a.len().min(10)]),
            (None, None) => "?".to_string(),
        }
    }
}

/// The fixed ordered checkpoint set. Offsets are configuration
/// (`CheckpointSchedule`), not data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Checkpoint {
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "24h")]
    H24,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "7d")]
    D7,
    #[serde(rename = "30d")]
    D30,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 6] = [
        Checkpoint::H1,
        Checkpoint::H4,
        Checkpoint::H24,
        Checkpoint::D3,
        Checkpoint::D7,
        Checkpoint::D30,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::H1 => "1h",
            Checkpoint::H4 => "4h",
            Checkpoint::H24 => "24h",
            Checkpoint::D3 => "3d",
            Checkpoint::D7 => "7d",
            Checkpoint::D30 => "30d",
        }
    }

    pub fn default_offset_secs(&self) -> i64 {
        match self {
            Checkpoint::H1 => 3_600,
            Checkpoint::H4 => 14_400,
            Checkpoint::H24 => 86_400,
            Checkpoint::D3 => 3 * DAY_SECS,
            Checkpoint::D7 => 7 * DAY_SECS,
            Checkpoint::D30 => 30 * DAY_SECS,
        }
    }
}

/// Offsets from entry time for each checkpoint, overridable for testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSchedule {
    pub offsets: BTreeMap<Checkpoint, i64>,
}

impl Default for CheckpointSchedule {
    fn default() -> Self {
        let offsets = Checkpoint::ALL
            .iter()
            .map(|c| (*c, c.default_offset_secs()))
            .collect();
        Self { offsets }
    }
}

impl CheckpointSchedule {
    pub fn offset(&self, checkpoint: Checkpoint) -> i64 {
        self.offsets
            .get(&checkpoint)
            .copied()
            .unwrap_or_else(|| checkpoint.default_offset_secs())
    }

    /// The subset of checkpoints whose offset has elapsed as of `now`.
    /// Pure function, no I/O.
    pub fn elapsed(&self, entry_time: i64, now: i64) -> Vec<Checkpoint> {
        Checkpoint::ALL
            .iter()
            .copied()
            .filter(|c| entry_time + self.offset(*c) <= now)
            .collect()
    }

    pub fn terminal_offset(&self) -> i64 {
        self.offset(Checkpoint::D30)
    }
}

/// Captured observation for one checkpoint. `price` is None when upstream had
/// no data for the slot (the checkpoint still counts as reached).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub timestamp: i64,
    pub price: Option<f64>,
    pub roi_multiplier: Option<f64>,
    pub roi_percentage: Option<f64>,
    pub reached: bool,
}

impl CheckpointData {
    pub fn reached(timestamp: i64, price: Option<f64>, entry_price: f64) -> Self {
        let roi_multiplier = price.map(|p| p / entry_price);
        Self {
            timestamp,
            price,
            roi_multiplier,
            roi_percentage: roi_multiplier.map(|m| (m - 1.0) * 100.0),
            reached: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeCategory {
    #[serde(rename = "MOON")]
    Moon,
    #[serde(rename = "WINNER")]
    Winner,
    #[serde(rename = "GOOD")]
    Good,
    #[serde(rename = "BREAK-EVEN")]
    BreakEven,
    #[serde(rename = "LOSER")]
    Loser,
    #[serde(rename = "CRASH")]
    Crash,
}

impl OutcomeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCategory::Moon => "MOON",
            OutcomeCategory::Winner => "WINNER",
            OutcomeCategory::Good => "GOOD",
            OutcomeCategory::BreakEven => "BREAK-EVEN",
            OutcomeCategory::Loser => "LOSER",
            OutcomeCategory::Crash => "CRASH",
        }
    }

    pub fn is_winner(&self) -> bool {
        matches!(
            self,
            OutcomeCategory::Moon | OutcomeCategory::Winner | OutcomeCategory::Good
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trajectory {
    Improved,
    Crashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakTiming {
    EarlyPeaker,
    LatePeaker,
}

/// One mention of one token by one channel at one entry time.
///
/// Created by the orchestrators, mutated exclusively by the lifecycle engine,
/// archived by the tracking store on terminal reach, never destroyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOutcome {
    // Identity
    pub signal_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub token_ref: TokenRef,
    pub signal_number: u32,
    /// Prior completed signal ids for this token on this channel, oldest first.
    #[serde(default)]
    pub previous_signal_ids: Vec<String>,
    pub first_message_id: i64,

    // Inputs
    pub entry_time: i64,
    pub entry_price: f64,

    // Continuous tracking
    pub ath_price: f64,
    pub ath_time: i64,
    pub days_to_ath: f64,
    pub current_price: f64,
    pub current_time: i64,

    // Discrete checkpoints
    #[serde(default)]
    pub checkpoints: BTreeMap<Checkpoint, CheckpointData>,

    // Terminal fields, set exactly once when status flips to completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_7_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_7_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_7_classification: Option<OutcomeCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_30_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_30_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_30_classification: Option<OutcomeCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory: Option<Trajectory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crash_severity_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_timing: Option<PeakTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_category: Option<OutcomeCategory>,
    #[serde(default)]
    pub is_winner: bool,

    /// Predicted ROI recorded at admission; compared to the actual ATH
    /// multiplier when the signal completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_roi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction_source: Option<PredictionSource>,

    pub status: SignalStatus,

    /// Consecutive terminal-attempt failures on the current checkpoint.
    #[serde(default)]
    pub fetch_failures: u32,
    /// Set when the orchestrator force-closes a signal (escalation path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl SignalOutcome {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: impl Into<String>,
        channel_name: impl Into<String>,
        token_ref: TokenRef,
        signal_number: u32,
        previous_signal_ids: Vec<String>,
        first_message_id: i64,
        entry_time: i64,
        entry_price: f64,
    ) -> Self {
        let channel_id = channel_id.into();
        let token_key = token_ref.token_key();
        let short = Uuid::new_v4().simple().to_string();
        let signal_id = format!(
            "{}:{}:{}:{}",
            channel_id,
            token_key,
            signal_number,
            &short[..8]
        );
        Self {
            signal_id,
            channel_id,
            channel_name: channel_name.into(),
            token_ref,
            signal_number,
            previous_signal_ids,
            first_message_id,
            entry_time,
            entry_price,
            ath_price: entry_price,
            ath_time: entry_time,
            days_to_ath: 0.0,
            current_price: entry_price,
            current_time: entry_time,
            checkpoints: BTreeMap::new(),
            day_7_price: None,
            day_7_multiplier: None,
            day_7_classification: None,
            day_30_price: None,
            day_30_multiplier: None,
            day_30_classification: None,
            trajectory: None,
            crash_severity_pct: None,
            peak_timing: None,
            outcome_category: None,
            is_winner: false,
            predicted_roi: None,
            prediction_source: None,
            status: SignalStatus::InProgress,
            fetch_failures: 0,
            provenance: None,
        }
    }

    pub fn token_key(&self) -> String {
        self.token_ref.token_key()
    }

    pub fn ath_multiplier(&self) -> f64 {
        if self.entry_price > 0.0 {
            self.ath_price / self.entry_price
        } else {
            0.0
        }
    }

    pub fn current_multiplier(&self) -> f64 {
        if self.entry_price > 0.0 {
            self.current_price / self.entry_price
        } else {
            0.0
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == SignalStatus::Completed
    }

    pub fn days_tracked(&self, now: i64) -> f64 {
        let end = if self.is_terminal() {
            self.current_time
        } else {
            now
        };
        ((end - self.entry_time).max(0)) as f64 / DAY_SECS as f64
    }
}

/// Where a prediction for a new mention came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionSource {
    None,
    Overall,
    ChannelToken,
    Blended,
}

impl PredictionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionSource::None => "none",
            PredictionSource::Overall => "overall",
            PredictionSource::ChannelToken => "channel_token",
            PredictionSource::Blended => "blended",
        }
    }
}

/// Explicit terminal handoff from the lifecycle engine to the learning
/// engine. A plain record, no callback registration.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalEvent {
    pub signal_id: String,
    pub channel_id: String,
    pub token_key: String,
    pub ath_multiplier: f64,
    pub day_30_multiplier: Option<f64>,
    pub days_to_ath: f64,
    pub trajectory: Trajectory,
    pub predicted_roi: Option<f64>,
}

impl TerminalEvent {
    /// Rebuild the handoff record from an archived signal (used by the
    /// bootstrap's final chronological learning pass).
    pub fn from_outcome(outcome: &SignalOutcome) -> Option<Self> {
        if !outcome.is_terminal() {
            return None;
        }
        Some(Self {
            signal_id: outcome.signal_id.clone(),
            channel_id: outcome.channel_id.clone(),
            token_key: outcome.token_key(),
            ath_multiplier: outcome.ath_multiplier(),
            day_30_multiplier: outcome.day_30_multiplier,
            days_to_ath: outcome.days_to_ath,
            trajectory: outcome.trajectory.unwrap_or(Trajectory::Improved),
            predicted_roi: outcome.predicted_roi,
        })
    }
}

/// Current-price reading from a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceReading {
    pub price: f64,
    pub market_cap: Option<f64>,
    pub liquidity: Option<f64>,
    pub volume_24h: Option<f64>,
    pub symbol_resolved: Option<String>,
    pub source: &'static str,
}

/// One daily OHLC bar, `day_ts` aligned to the daily bucket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub day_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Daily OHLC covering `[entry_time, until]`, with the window ATH derived
/// from the bars' highs.
#[derive(Debug, Clone, PartialEq)]
pub struct OhlcSeries {
    pub bars: Vec<DailyBar>,
    pub ath_price: f64,
    pub ath_time: i64,
    pub days_to_ath: f64,
}

impl OhlcSeries {
    pub fn from_bars(bars: Vec<DailyBar>, entry_time: i64) -> Self {
        let mut ath_price = 0.0;
        let mut ath_time = entry_time;
        for bar in &bars {
            if bar.high > ath_price {
                ath_price = bar.high;
                ath_time = bar.day_ts;
            }
        }
        let days_to_ath = ((ath_time - entry_time).max(0)) as f64 / DAY_SECS as f64;
        Self {
            bars,
            ath_price,
            ath_time,
            days_to_ath,
        }
    }
}

/// Inbound contract from the text-extraction layer: one recognized token
/// mention in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMention {
    pub message_id: i64,
    pub channel_id: String,
    pub channel_name: String,
    pub token_ref: TokenRef,
    /// ISO-8601 UTC entry timestamp, as delivered by the extractor.
    pub entry_time: DateTime<Utc>,
    /// True iff the extractor saw an explicit `$` or `#` marker.
    #[serde(default)]
    pub explicit_prefix: bool,
}

impl ExtractedMention {
    pub fn entry_ts(&self) -> i64 {
        self.entry_time.timestamp()
    }
}

/// Bootstrap checkpoint: written every N messages, deleted on clean finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapProgress {
    pub version: u32,
    pub total_messages: u64,
    pub processed_messages: u64,
    pub last_processed_message_id: i64,
    pub last_checkpoint_time: i64,
    pub successful_outcomes: u64,
    pub failed_outcomes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_key_prefers_address() {
        let by_addr = TokenRef::from_address(Chain::Evm, "0xAbC123").with_symbol("pepe");
        assert_eq!(by_addr.token_key(), "evm:0xabc123");

        let by_symbol = TokenRef::from_symbol(Chain::Evm, "eth");
        assert_eq!(by_symbol.token_key(), "ETH");
    }

    #[test]
    fn test_checkpoint_schedule_elapsed_subset() {
        let schedule = CheckpointSchedule::default();
        let entry = 1_700_000_000;

        assert!(schedule.elapsed(entry, entry).is_empty());
        assert_eq!(schedule.elapsed(entry, entry + 3_600), vec![Checkpoint::H1]);
        assert_eq!(
            schedule.elapsed(entry, entry + 4 * DAY_SECS),
            vec![
                Checkpoint::H1,
                Checkpoint::H4,
                Checkpoint::H24,
                Checkpoint::D3
            ]
        );
        assert_eq!(
            schedule.elapsed(entry, entry + 31 * DAY_SECS).len(),
            Checkpoint::ALL.len()
        );
    }

    #[test]
    fn test_checkpoint_data_roi() {
        let data = CheckpointData::reached(100, Some(150.0), 100.0);
        assert_eq!(data.roi_multiplier, Some(1.5));
        assert_eq!(data.roi_percentage, Some(50.0));
        assert!(data.reached);

        let missing = CheckpointData::reached(100, None, 100.0);
        assert!(missing.reached);
        assert!(missing.price.is_none());
        assert!(missing.roi_multiplier.is_none());
    }

    #[test]
    fn test_ohlc_series_ath_from_highs() {
        let entry = day_bucket(1_700_000_000);
        let bars = vec![
            DailyBar {
                day_ts: entry,
                open: 1.0,
                high: 1.2,
                low: 0.9,
                close: 1.1,
            },
            DailyBar {
                day_ts: entry + DAY_SECS,
                open: 1.1,
                high: 2.4,
                low: 1.0,
                close: 1.3,
            },
            DailyBar {
                day_ts: entry + 2 * DAY_SECS,
                open: 1.3,
                high: 1.9,
                low: 1.2,
                close: 1.5,
            },
        ];
        let series = OhlcSeries::from_bars(bars, entry);
        assert_eq!(series.ath_price, 2.4);
        assert_eq!(series.ath_time, entry + DAY_SECS);
        assert!((series.days_to_ath - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_signal_outcome_roundtrip() {
        let token = TokenRef::from_symbol(Chain::Evm, "ETH");
        let mut outcome = SignalOutcome::new(
            "c1",
            "Alpha Calls",
            token,
            1,
            vec![],
            42,
            1_700_000_000,
            1000.0,
        );
        outcome.checkpoints.insert(
            Checkpoint::H1,
            CheckpointData::reached(1_700_003_600, Some(1100.0), 1000.0),
        );

        let json = serde_json::to_string(&outcome).unwrap();
        let back: SignalOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outcome);
        assert_eq!(back.checkpoints.len(), 1);
    }
}
