//! Channel reputation: temporal-difference learning, aggregate scoring, and
//! the reputation stores.

pub mod learning;
pub mod scoring;
pub mod storage;

pub use learning::{LearningEngine, LearningError, Prediction};
pub use storage::ReputationStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse quality bucket from the composite score. Channels with too few
/// signals are floored to `Unreliable` regardless of score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReputationTier {
    Elite,
    Excellent,
    Good,
    Average,
    Poor,
    #[default]
    Unreliable,
}

impl ReputationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationTier::Elite => "Elite",
            ReputationTier::Excellent => "Excellent",
            ReputationTier::Good => "Good",
            ReputationTier::Average => "Average",
            ReputationTier::Poor => "Poor",
            ReputationTier::Unreliable => "Unreliable",
        }
    }
}

/// What a reader should do with this channel's calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HoldPeriod {
    /// Peaks land in the first week; take profits in 1–7 days.
    ExitEarly,
    /// Peaks land late; hold 7–30 days.
    HoldLonger,
    #[default]
    Mixed,
}

impl HoldPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldPeriod::ExitEarly => "exit_early",
            HoldPeriod::HoldLonger => "hold_longer",
            HoldPeriod::Mixed => "mixed",
        }
    }
}

/// One `(predicted, actual)` pair recorded when a signal completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub signal_id: String,
    pub predicted: f64,
    pub actual: f64,
    pub recorded_at: i64,
}

/// Per-token state inside one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelTokenStats {
    pub mentions: u64,
    pub avg_roi: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_roi: Option<f64>,
    pub prediction_count: u64,
    pub mae: f64,
    /// `1 / (1 + mae)` over this key's prediction history.
    pub prediction_accuracy: f64,
    pub last_mentioned: i64,
    pub wins: u64,
    pub win_rate: f64,
    pub best_roi: f64,
    pub worst_roi: f64,
}

/// Everything known about one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelReputation {
    pub channel_id: String,
    pub channel_name: String,

    // Aggregates over completed signals (recomputed lazily).
    pub total_signals: u64,
    pub winners: u64,
    pub win_rate: f64,
    pub avg_roi: f64,
    pub median_roi: f64,
    pub best_roi: f64,
    pub worst_roi: f64,
    pub roi_stddev: f64,
    pub sharpe_like_ratio: f64,
    pub avg_days_to_ath: f64,
    pub early_peaker_pct: f64,
    pub late_peaker_pct: f64,
    pub crash_rate_post_day7: f64,

    // Learned state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_roi: Option<f64>,
    pub prediction_count: u64,
    pub mae: f64,
    #[serde(default)]
    pub prediction_history: Vec<PredictionRecord>,

    // Composite score.
    pub reputation_score: f64,
    pub reputation_tier: ReputationTier,
    pub recommended_hold_period: HoldPeriod,

    pub first_signal_date: Option<i64>,
    pub last_signal_date: Option<i64>,
    pub last_updated: i64,

    #[serde(default)]
    pub tokens: HashMap<String, ChannelTokenStats>,
}

/// Per-channel running ROI state inside the cross-channel record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ChannelRoi {
    pub observations: u64,
    pub avg_roi: f64,
}

/// How one token performed across every channel that called it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CrossChannelTokenStats {
    pub token_key: String,
    pub total_mentions: u64,
    pub channel_count: u64,
    pub avg_roi: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_channel_key: Option<String>,
    pub best_channel_roi: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_channel_key: Option<String>,
    pub worst_channel_roi: f64,
    /// `1 − stddev/mean` over all observations, clamped to [0, 1].
    pub consensus_strength: f64,

    #[serde(default)]
    pub per_channel: HashMap<String, ChannelRoi>,
    /// Welford accumulator for the observation stddev.
    pub m2: f64,
}
