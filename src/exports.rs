//! Read-only export snapshots.
//!
//! Exporters (CSV, spreadsheets; out of scope here) consume these rows without
//! mutation. Column sets and ordering follow the external contract; the
//! `export` subcommand serializes them as JSON.

use crate::models::{day_bucket, SignalOutcome, DAY_SECS};
use crate::reputation::ReputationStore;
use crate::tracking::StoreSnapshot;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub message_id: i64,
    pub timestamp: i64,
    pub channel: String,
    pub token_address: Option<String>,
    pub token_chain: String,
    pub token_symbol: Option<String>,
    pub channel_reputation_score: f64,
    pub channel_reputation_tier: String,
    pub channel_expected_roi_overall: Option<f64>,
    pub channel_expected_roi_token: Option<f64>,
    pub channel_win_rate: f64,
    pub prediction_source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelRankingRow {
    pub channel: String,
    pub total_signals: u64,
    pub win_rate: f64,
    pub avg_roi: f64,
    pub median_roi: f64,
    pub best_roi: f64,
    pub worst_roi: f64,
    pub expected_roi: Option<f64>,
    pub sharpe_like: f64,
    pub speed_score: f64,
    pub reputation_score: f64,
    pub reputation_tier: String,
    pub prediction_count: u64,
    pub mae: f64,
    pub first_signal_date: Option<i64>,
    pub last_signal_date: Option<i64>,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelTokenRow {
    pub channel: String,
    pub token_key: String,
    pub mentions: u64,
    pub avg_roi: f64,
    pub expected_roi: Option<f64>,
    pub win_rate: f64,
    pub best_roi: f64,
    pub worst_roi: f64,
    pub prediction_accuracy: f64,
    pub last_mentioned: i64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenCrossChannelRow {
    pub token_key: String,
    pub total_mentions: u64,
    pub channel_count: u64,
    pub avg_roi: f64,
    pub best_channel: Option<String>,
    pub best_channel_roi: f64,
    pub worst_channel: Option<String>,
    pub worst_channel_roi: f64,
    pub consensus_strength: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceRow {
    pub token_address: Option<String>,
    pub chain: String,
    pub first_message_id: i64,
    pub entry_price: f64,
    pub entry_time: i64,
    pub ath_price: f64,
    pub ath_time: i64,
    pub ath_multiplier: f64,
    pub current_multiplier: f64,
    pub days_tracked: f64,
    pub days_to_ath: f64,
    pub peak_timing: Option<String>,
    pub day_7_price: Option<f64>,
    pub day_7_multiplier: Option<f64>,
    pub day_7_classification: Option<String>,
    pub day_30_price: Option<f64>,
    pub day_30_multiplier: Option<f64>,
    pub day_30_classification: Option<String>,
    pub trajectory: Option<String>,
    pub outcome_category: Option<String>,
}

/// One row per tracked signal, newest first, with the channel's current
/// reputation attached the way a reader would want to see it next to the
/// message.
pub fn messages(snapshot: &StoreSnapshot, reputation: &ReputationStore) -> Vec<MessageRow> {
    let mut rows: Vec<MessageRow> = snapshot
        .active
        .values()
        .chain(snapshot.completed_signals())
        .map(|signal| {
            let rep = reputation.channel(&signal.channel_id);
            let token_key = signal.token_key();
            MessageRow {
                message_id: signal.first_message_id,
                timestamp: signal.entry_time,
                channel: signal.channel_name.clone(),
                token_address: signal.token_ref.address.clone(),
                token_chain: signal.token_ref.chain.as_str().to_string(),
                token_symbol: signal.token_ref.symbol.clone(),
                channel_reputation_score: rep.as_ref().map(|r| r.reputation_score).unwrap_or(0.0),
                channel_reputation_tier: rep
                    .as_ref()
                    .map(|r| r.reputation_tier.as_str().to_string())
                    .unwrap_or_else(|| "Unreliable".to_string()),
                channel_expected_roi_overall: rep.as_ref().and_then(|r| r.expected_roi),
                channel_expected_roi_token: rep
                    .as_ref()
                    .and_then(|r| r.tokens.get(&token_key))
                    .and_then(|t| t.expected_roi),
                channel_win_rate: rep.as_ref().map(|r| r.win_rate).unwrap_or(0.0),
                prediction_source: signal
                    .prediction_source
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_else(|| "none".to_string()),
            }
        })
        .collect();
    rows.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
    rows
}

/// All channels, best reputation first.
pub fn channel_rankings(reputation: &ReputationStore) -> Vec<ChannelRankingRow> {
    let mut rows: Vec<ChannelRankingRow> = reputation
        .channels()
        .into_iter()
        .map(|rep| ChannelRankingRow {
            channel: rep.channel_name.clone(),
            total_signals: rep.total_signals,
            win_rate: rep.win_rate,
            avg_roi: rep.avg_roi,
            median_roi: rep.median_roi,
            best_roi: rep.best_roi,
            worst_roi: rep.worst_roi,
            expected_roi: rep.expected_roi,
            sharpe_like: rep.sharpe_like_ratio,
            speed_score: crate::reputation::scoring::speed_score(rep.avg_days_to_ath),
            reputation_score: rep.reputation_score,
            reputation_tier: rep.reputation_tier.as_str().to_string(),
            prediction_count: rep.prediction_count,
            mae: rep.mae,
            first_signal_date: rep.first_signal_date,
            last_signal_date: rep.last_signal_date,
            last_updated: rep.last_updated,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.reputation_score
            .partial_cmp(&a.reputation_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows
}

pub fn channel_token_performance(reputation: &ReputationStore) -> Vec<ChannelTokenRow> {
    let mut rows = Vec::new();
    for rep in reputation.channels() {
        for (token_key, stats) in &rep.tokens {
            rows.push(ChannelTokenRow {
                channel: rep.channel_name.clone(),
                token_key: token_key.clone(),
                mentions: stats.mentions,
                avg_roi: stats.avg_roi,
                expected_roi: stats.expected_roi,
                win_rate: stats.win_rate,
                best_roi: stats.best_roi,
                worst_roi: stats.worst_roi,
                prediction_accuracy: stats.prediction_accuracy,
                last_mentioned: stats.last_mentioned,
                recommendation: recommendation_for(stats.avg_roi, stats.mentions),
            });
        }
    }
    rows.sort_by(|a, b| {
        (a.channel.as_str(), a.token_key.as_str()).cmp(&(b.channel.as_str(), b.token_key.as_str()))
    });
    rows
}

pub fn token_cross_channel(reputation: &ReputationStore) -> Vec<TokenCrossChannelRow> {
    let mut rows: Vec<TokenCrossChannelRow> = reputation
        .cross_channel_all()
        .into_iter()
        .map(|stats| TokenCrossChannelRow {
            token_key: stats.token_key.clone(),
            total_mentions: stats.total_mentions,
            channel_count: stats.channel_count,
            avg_roi: stats.avg_roi,
            best_channel: stats.best_channel_key.clone(),
            best_channel_roi: stats.best_channel_roi,
            worst_channel: stats.worst_channel_key.clone(),
            worst_channel_roi: stats.worst_channel_roi,
            consensus_strength: stats.consensus_strength,
        })
        .collect();
    rows.sort_by_key(|r| std::cmp::Reverse(r.total_mentions));
    rows
}

/// Per-signal performance, completed and in-flight alike.
pub fn performance(snapshot: &StoreSnapshot, now: i64) -> Vec<PerformanceRow> {
    let mut rows: Vec<PerformanceRow> = snapshot
        .active
        .values()
        .chain(snapshot.completed_signals())
        .map(|signal| performance_row(signal, now))
        .collect();
    rows.sort_by_key(|r| std::cmp::Reverse(r.entry_time));
    rows
}

fn performance_row(signal: &SignalOutcome, now: i64) -> PerformanceRow {
    PerformanceRow {
        token_address: signal.token_ref.address.clone(),
        chain: signal.token_ref.chain.as_str().to_string(),
        first_message_id: signal.first_message_id,
        entry_price: signal.entry_price,
        entry_time: signal.entry_time,
        ath_price: signal.ath_price,
        ath_time: signal.ath_time,
        ath_multiplier: signal.ath_multiplier(),
        current_multiplier: signal.current_multiplier(),
        days_tracked: signal.days_tracked(now),
        days_to_ath: signal.days_to_ath,
        peak_timing: signal.peak_timing.map(|p| {
            match p {
                crate::models::PeakTiming::EarlyPeaker => "early_peaker",
                crate::models::PeakTiming::LatePeaker => "late_peaker",
            }
            .to_string()
        }),
        day_7_price: signal.day_7_price,
        day_7_multiplier: signal.day_7_multiplier,
        day_7_classification: signal.day_7_classification.map(|c| c.as_str().to_string()),
        day_30_price: signal.day_30_price,
        day_30_multiplier: signal.day_30_multiplier,
        day_30_classification: signal.day_30_classification.map(|c| c.as_str().to_string()),
        trajectory: signal.trajectory.map(|t| {
            match t {
                crate::models::Trajectory::Improved => "improved",
                crate::models::Trajectory::Crashed => "crashed",
            }
            .to_string()
        }),
        outcome_category: signal.outcome_category.map(|c| c.as_str().to_string()),
    }
}

fn recommendation_for(avg_roi: f64, mentions: u64) -> String {
    if mentions == 0 {
        return "untested".to_string();
    }
    if avg_roi >= 2.0 {
        "follow".to_string()
    } else if avg_roi >= 1.2 {
        "watch".to_string()
    } else {
        "fade".to_string()
    }
}

/// Days left in a signal's window, for operator summaries.
pub fn days_remaining(signal: &SignalOutcome, now: i64, window_secs: i64) -> f64 {
    let end = day_bucket(signal.entry_time) + window_secs;
    ((end - now).max(0)) as f64 / DAY_SECS as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chain, SignalStatus, TokenRef};
    use std::collections::HashMap;

    fn snapshot_with(signals: Vec<SignalOutcome>) -> StoreSnapshot {
        let mut completed: HashMap<String, Vec<SignalOutcome>> = HashMap::new();
        let mut active = HashMap::new();
        for s in signals {
            if s.is_terminal() {
                completed.entry(s.token_key()).or_default().push(s);
            } else {
                active.insert(s.token_key(), s);
            }
        }
        StoreSnapshot { active, completed }
    }

    fn signal(channel: &str, token: &str, entry_time: i64, terminal: bool) -> SignalOutcome {
        let mut s = SignalOutcome::new(
            channel,
            channel,
            TokenRef::from_symbol(Chain::Evm, token),
            1,
            Vec::new(),
            entry_time,
            entry_time,
            1.0,
        );
        if terminal {
            s.status = SignalStatus::Completed;
        }
        s
    }

    #[test]
    fn test_messages_sorted_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let reputation = ReputationStore::new(dir.path().to_path_buf());
        let snapshot = snapshot_with(vec![
            signal("c1", "A", 100, true),
            signal("c1", "B", 300, false),
            signal("c2", "C", 200, true),
        ]);

        let rows = messages(&snapshot, &reputation);
        let stamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![300, 200, 100]);
        assert_eq!(rows[0].prediction_source, "none");
    }

    #[test]
    fn test_rankings_sorted_by_score() {
        let dir = tempfile::tempdir().unwrap();
        let reputation = ReputationStore::new(dir.path().to_path_buf());
        reputation.with_channel("low", "Low", |r| r.reputation_score = 12.0);
        reputation.with_channel("high", "High", |r| r.reputation_score = 88.0);

        let rows = channel_rankings(&reputation);
        assert_eq!(rows[0].channel, "High");
        assert_eq!(rows[1].channel, "Low");
    }

    #[test]
    fn test_performance_covers_active_and_completed() {
        let snapshot = snapshot_with(vec![
            signal("c1", "A", 100, true),
            signal("c1", "B", 200, false),
        ]);
        let rows = performance(&snapshot, 500_000);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_recommendation_bands() {
        assert_eq!(recommendation_for(2.5, 3), "follow");
        assert_eq!(recommendation_for(1.4, 3), "watch");
        assert_eq!(recommendation_for(0.8, 3), "fade");
        assert_eq!(recommendation_for(9.0, 0), "untested");
    }
}
