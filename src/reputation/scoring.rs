//! Aggregate reputation metrics and the composite score.
//!
//! Recomputed lazily over a channel's completed signals whenever the
//! learning engine marks the channel dirty. Reputation never holds the
//! signals themselves; callers pass a tracking-store snapshot.

use crate::models::{PeakTiming, SignalOutcome, Trajectory};
use crate::reputation::{ChannelReputation, ChannelTokenStats, HoldPeriod, ReputationTier};
use crate::tracking::StoreSnapshot;
use statrs::statistics::{Data, Median, Statistics};
use std::collections::HashMap;

const SHARPE_EPSILON: f64 = 1e-6;
const SPEED_PIVOT_DAYS: f64 = 14.0;
const CONFIDENCE_PIVOT_SIGNALS: f64 = 20.0;
const TIMING_DOMINANCE_PCT: f64 = 70.0;

/// Recompute one channel's aggregates from its completed signals.
pub fn recompute_channel(
    rep: &mut ChannelReputation,
    snapshot: &StoreSnapshot,
    winner_ath_threshold: f64,
    min_signals: u32,
    now: i64,
) {
    let outcomes: Vec<&SignalOutcome> = snapshot
        .completed_signals()
        .filter(|s| s.channel_id == rep.channel_id)
        .collect();

    rep.total_signals = outcomes.len() as u64;
    rep.last_updated = now;

    if outcomes.is_empty() {
        rep.reputation_score = 0.0;
        rep.reputation_tier = ReputationTier::Unreliable;
        rep.recommended_hold_period = HoldPeriod::Mixed;
        return;
    }

    let rois: Vec<f64> = outcomes.iter().map(|s| s.ath_multiplier()).collect();
    let total = outcomes.len() as f64;

    rep.winners = rois
        .iter()
        .filter(|r| **r >= winner_ath_threshold)
        .count() as u64;
    rep.win_rate = rep.winners as f64 / total;
    rep.avg_roi = (&rois).mean();
    rep.median_roi = Data::new(rois.clone()).median();
    rep.best_roi = rois.iter().copied().fold(f64::MIN, f64::max);
    rep.worst_roi = rois.iter().copied().fold(f64::MAX, f64::min);
    rep.roi_stddev = if rois.len() > 1 { (&rois).std_dev() } else { 0.0 };
    rep.sharpe_like_ratio = (rep.avg_roi - 1.0) / rep.roi_stddev.max(SHARPE_EPSILON);

    rep.avg_days_to_ath = outcomes.iter().map(|s| s.days_to_ath).sum::<f64>() / total;
    let early = outcomes
        .iter()
        .filter(|s| s.peak_timing == Some(PeakTiming::EarlyPeaker))
        .count() as f64;
    let late = outcomes
        .iter()
        .filter(|s| s.peak_timing == Some(PeakTiming::LatePeaker))
        .count() as f64;
    rep.early_peaker_pct = early / total * 100.0;
    rep.late_peaker_pct = late / total * 100.0;
    rep.crash_rate_post_day7 = outcomes
        .iter()
        .filter(|s| s.trajectory == Some(Trajectory::Crashed))
        .count() as f64
        / total;

    rep.first_signal_date = outcomes.iter().map(|s| s.entry_time).min();
    rep.last_signal_date = outcomes.iter().map(|s| s.entry_time).max();

    recompute_token_stats(rep, &outcomes, winner_ath_threshold);

    rep.reputation_score = composite_score(rep);
    rep.reputation_tier = tier_for(rep.reputation_score, rep.total_signals, min_signals);
    rep.recommended_hold_period = hold_period_for(rep.early_peaker_pct, rep.late_peaker_pct);
}

/// Refresh the per-token aggregate slice; learned fields (expected_roi,
/// mae, accuracy) are owned by the learning engine and left untouched.
fn recompute_token_stats(
    rep: &mut ChannelReputation,
    outcomes: &[&SignalOutcome],
    winner_ath_threshold: f64,
) {
    let mut grouped: HashMap<String, Vec<&SignalOutcome>> = HashMap::new();
    for outcome in outcomes {
        grouped
            .entry(outcome.token_key())
            .or_default()
            .push(outcome);
    }

    for (token_key, signals) in grouped {
        let entry = rep.tokens.entry(token_key).or_default();
        let rois: Vec<f64> = signals.iter().map(|s| s.ath_multiplier()).collect();
        entry.mentions = signals.len() as u64;
        entry.avg_roi = (&rois).mean();
        entry.wins = rois
            .iter()
            .filter(|r| **r >= winner_ath_threshold)
            .count() as u64;
        entry.win_rate = entry.wins as f64 / entry.mentions as f64;
        entry.best_roi = rois.iter().copied().fold(f64::MIN, f64::max);
        entry.worst_roi = rois.iter().copied().fold(f64::MAX, f64::min);
        entry.last_mentioned = entry
            .last_mentioned
            .max(signals.iter().map(|s| s.entry_time).max().unwrap_or(0));
    }
}

pub fn speed_score(avg_days_to_ath: f64) -> f64 {
    ((SPEED_PIVOT_DAYS - avg_days_to_ath) / SPEED_PIVOT_DAYS).clamp(0.0, 1.0) * 100.0
}

pub fn confidence_score(total_signals: u64) -> f64 {
    (total_signals as f64 / CONFIDENCE_PIVOT_SIGNALS).clamp(0.0, 1.0) * 100.0
}

/// Composite score, weights summing to 100, clipped into [0, 100].
pub fn composite_score(rep: &ChannelReputation) -> f64 {
    let win_component = rep.win_rate * 30.0;
    let roi_component = ((rep.avg_roi - 1.0) * 100.0 * 0.25).clamp(0.0, 25.0);
    let sharpe_component = (rep.sharpe_like_ratio * 10.0 * 0.20).clamp(0.0, 20.0);
    let speed_component = speed_score(rep.avg_days_to_ath) * 0.15;
    let confidence_component = confidence_score(rep.total_signals) * 0.10;

    (win_component + roi_component + sharpe_component + speed_component + confidence_component)
        .clamp(0.0, 100.0)
}

pub fn tier_for(score: f64, total_signals: u64, min_signals: u32) -> ReputationTier {
    // Insufficient-evidence floor: too few signals is always Unreliable.
    if total_signals < min_signals as u64 {
        return ReputationTier::Unreliable;
    }
    if score >= 90.0 {
        ReputationTier::Elite
    } else if score >= 75.0 {
        ReputationTier::Excellent
    } else if score >= 60.0 {
        ReputationTier::Good
    } else if score >= 40.0 {
        ReputationTier::Average
    } else if score >= 20.0 {
        ReputationTier::Poor
    } else {
        ReputationTier::Unreliable
    }
}

pub fn hold_period_for(early_pct: f64, late_pct: f64) -> HoldPeriod {
    if early_pct >= TIMING_DOMINANCE_PCT {
        HoldPeriod::ExitEarly
    } else if late_pct >= TIMING_DOMINANCE_PCT {
        HoldPeriod::HoldLonger
    } else {
        HoldPeriod::Mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chain, SignalStatus, TokenRef};

    fn terminal_signal(
        channel: &str,
        token: &str,
        number: u32,
        entry_price: f64,
        ath: f64,
        days_to_ath: f64,
        crashed: bool,
    ) -> SignalOutcome {
        let mut s = SignalOutcome::new(
            channel,
            channel,
            TokenRef::from_symbol(Chain::Evm, token),
            number,
            Vec::new(),
            1,
            1_700_000_000 + number as i64,
            entry_price,
        );
        s.ath_price = entry_price * ath;
        s.days_to_ath = days_to_ath;
        s.peak_timing = Some(if days_to_ath <= 7.0 {
            PeakTiming::EarlyPeaker
        } else {
            PeakTiming::LatePeaker
        });
        s.trajectory = Some(if crashed {
            Trajectory::Crashed
        } else {
            Trajectory::Improved
        });
        s.status = SignalStatus::Completed;
        s
    }

    fn snapshot_of(signals: Vec<SignalOutcome>) -> StoreSnapshot {
        let mut completed: HashMap<String, Vec<SignalOutcome>> = HashMap::new();
        for s in signals {
            completed.entry(s.token_key()).or_default().push(s);
        }
        StoreSnapshot {
            active: HashMap::new(),
            completed,
        }
    }

    #[test]
    fn test_recompute_basic_aggregates() {
        let snapshot = snapshot_of(vec![
            terminal_signal("c1", "A", 1, 1.0, 3.0, 2.0, false),
            terminal_signal("c1", "B", 1, 1.0, 1.2, 10.0, true),
            terminal_signal("c1", "C", 1, 1.0, 2.2, 4.0, false),
        ]);

        let mut rep = ChannelReputation {
            channel_id: "c1".to_string(),
            ..Default::default()
        };
        recompute_channel(&mut rep, &snapshot, 2.0, 5, 1_700_500_000);

        assert_eq!(rep.total_signals, 3);
        assert_eq!(rep.winners, 2);
        assert!((rep.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((rep.avg_roi - (3.0 + 1.2 + 2.2) / 3.0).abs() < 1e-12);
        assert_eq!(rep.median_roi, 2.2);
        assert_eq!(rep.best_roi, 3.0);
        assert_eq!(rep.worst_roi, 1.2);
        assert!((rep.crash_rate_post_day7 - 1.0 / 3.0).abs() < 1e-12);
        // 3 < 5 signals: evidence floor.
        assert_eq!(rep.reputation_tier, ReputationTier::Unreliable);
        assert!(rep.reputation_score > 0.0);
    }

    #[test]
    fn test_token_substats() {
        let snapshot = snapshot_of(vec![
            terminal_signal("c1", "A", 1, 1.0, 3.0, 2.0, false),
            terminal_signal("c1", "A", 2, 2.0, 1.5, 3.0, false),
        ]);
        let mut rep = ChannelReputation {
            channel_id: "c1".to_string(),
            ..Default::default()
        };
        recompute_channel(&mut rep, &snapshot, 2.0, 5, 0);

        let token = rep.tokens.get("A").unwrap();
        assert_eq!(token.mentions, 2);
        assert!((token.avg_roi - 2.25).abs() < 1e-12);
        assert_eq!(token.wins, 1);
        assert_eq!(token.best_roi, 3.0);
        assert_eq!(token.worst_roi, 1.5);
    }

    #[test]
    fn test_speed_and_confidence_bounds() {
        assert_eq!(speed_score(0.0), 100.0);
        assert_eq!(speed_score(14.0), 0.0);
        assert_eq!(speed_score(30.0), 0.0);
        assert!((speed_score(7.0) - 50.0).abs() < 1e-12);

        assert_eq!(confidence_score(0), 0.0);
        assert_eq!(confidence_score(10), 50.0);
        assert_eq!(confidence_score(20), 100.0);
        assert_eq!(confidence_score(500), 100.0);
    }

    #[test]
    fn test_tier_thresholds_and_floor() {
        assert_eq!(tier_for(95.0, 30, 5), ReputationTier::Elite);
        assert_eq!(tier_for(80.0, 30, 5), ReputationTier::Excellent);
        assert_eq!(tier_for(65.0, 30, 5), ReputationTier::Good);
        assert_eq!(tier_for(45.0, 30, 5), ReputationTier::Average);
        assert_eq!(tier_for(25.0, 30, 5), ReputationTier::Poor);
        assert_eq!(tier_for(10.0, 30, 5), ReputationTier::Unreliable);
        // Score is irrelevant below the signal floor.
        assert_eq!(tier_for(95.0, 4, 5), ReputationTier::Unreliable);
    }

    #[test]
    fn test_hold_period_recommendation() {
        assert_eq!(hold_period_for(75.0, 10.0), HoldPeriod::ExitEarly);
        assert_eq!(hold_period_for(10.0, 82.0), HoldPeriod::HoldLonger);
        assert_eq!(hold_period_for(50.0, 50.0), HoldPeriod::Mixed);
    }

    #[test]
    fn test_composite_score_clipping() {
        let rep = ChannelReputation {
            win_rate: 1.0,
            avg_roi: 50.0,
            sharpe_like_ratio: 99.0,
            avg_days_to_ath: 0.5,
            total_signals: 100,
            ..Default::default()
        };
        let score = composite_score(&rep);
        assert!(score <= 100.0);
        // 30 + 25 + 20 + ~14.5 + 10
        assert!(score > 95.0);

        let hopeless = ChannelReputation {
            win_rate: 0.0,
            avg_roi: 0.2,
            sharpe_like_ratio: -3.0,
            avg_days_to_ath: 29.0,
            total_signals: 0,
            ..Default::default()
        };
        assert_eq!(composite_score(&hopeless), 0.0);
    }
}
