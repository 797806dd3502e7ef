//! Temporal-difference learning over terminal outcomes.
//!
//! Three independent levels update on every terminal signal: the channel as
//! a whole, the (channel, token) pair, and the token across channels. A new
//! mention gets a weighted blend of whichever levels carry data. Updates
//! within one channel are serialized; cross-channel state is a commutative
//! running mean, so it needs no ordering.

use crate::models::{PredictionSource, TerminalEvent};
use crate::reputation::{PredictionRecord, ReputationStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Blend weights for the three levels (normalized over levels with data).
const WEIGHT_OVERALL: f64 = 0.4;
const WEIGHT_CHANNEL_TOKEN: f64 = 0.5;
const WEIGHT_TOKEN_CROSS: f64 = 0.1;

const PREDICTION_HISTORY_CAP: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearningError {
    /// Division by zero or a non-finite intermediate; the update is reverted.
    NumericDomain(String),
}

impl std::fmt::Display for LearningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NumericDomain(msg) => write!(f, "numeric domain error: {}", msg),
        }
    }
}

impl std::error::Error for LearningError {}

/// Predicted ROI for a new mention, with its provenance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub expected_roi: f64,
    pub source: PredictionSource,
}

impl Prediction {
    pub fn neutral() -> Self {
        Self {
            expected_roi: 1.0,
            source: PredictionSource::None,
        }
    }
}

pub struct LearningEngine {
    alpha: f64,
    store: Arc<ReputationStore>,
    /// Serializes learning updates within one channel.
    channel_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Channels whose aggregates need a lazy recompute.
    dirty: Mutex<HashSet<String>>,
}

impl LearningEngine {
    pub fn new(alpha: f64, store: Arc<ReputationStore>) -> Self {
        Self {
            alpha,
            store,
            channel_locks: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<ReputationStore> {
        &self.store
    }

    fn channel_lock(&self, channel_id: &str) -> Arc<Mutex<()>> {
        self.channel_locks
            .lock()
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the set of channels dirtied since the last call.
    pub fn take_dirty_channels(&self) -> HashSet<String> {
        std::mem::take(&mut *self.dirty.lock())
    }

    /// Apply all three TD updates for one terminal outcome.
    pub fn apply_terminal(
        &self,
        event: &TerminalEvent,
        channel_name: &str,
        now: i64,
    ) -> Result<(), LearningError> {
        let actual = event.ath_multiplier;
        if !actual.is_finite() || actual < 0.0 {
            return Err(LearningError::NumericDomain(format!(
                "actual ROI {} for {}",
                actual, event.signal_id
            )));
        }

        let lock = self.channel_lock(&event.channel_id);
        let _serialized = lock.lock();

        let alpha = self.alpha;
        self.store
            .with_channel(&event.channel_id, channel_name, |rep| {
                // Level 1: overall channel. First outcome seeds the estimate.
                rep.expected_roi = Some(match rep.expected_roi {
                    Some(e) => e + alpha * (actual - e),
                    None => actual,
                });

                // Level 2: channel × token, same rule, independent state.
                let token = rep.tokens.entry(event.token_key.clone()).or_default();
                token.expected_roi = Some(match token.expected_roi {
                    Some(e) => e + alpha * (actual - e),
                    None => actual,
                });
                token.last_mentioned = now;

                // Prediction bookkeeping against what was promised at entry.
                if let Some(predicted) = event.predicted_roi {
                    let err = (predicted - actual).abs();

                    rep.prediction_count += 1;
                    rep.mae = incremental_mean(rep.mae, err, rep.prediction_count);
                    rep.prediction_history.push(PredictionRecord {
                        signal_id: event.signal_id.clone(),
                        predicted,
                        actual,
                        recorded_at: now,
                    });
                    if rep.prediction_history.len() > PREDICTION_HISTORY_CAP {
                        let excess = rep.prediction_history.len() - PREDICTION_HISTORY_CAP;
                        rep.prediction_history.drain(..excess);
                    }

                    let token = rep.tokens.entry(event.token_key.clone()).or_default();
                    token.prediction_count += 1;
                    token.mae = incremental_mean(token.mae, err, token.prediction_count);
                    token.prediction_accuracy = 1.0 / (1.0 + token.mae);
                }

                rep.last_updated = now;
            });

        // Level 3: token across channels. Commutative running mean plus a
        // Welford accumulator for the consensus spread.
        self.store.with_cross_channel(&event.token_key, |stats| {
            stats.total_mentions += 1;
            let n = stats.total_mentions as f64;
            let delta = actual - stats.avg_roi;
            stats.avg_roi += delta / n;
            let delta2 = actual - stats.avg_roi;
            stats.m2 += delta * delta2;

            let channel = stats
                .per_channel
                .entry(event.channel_id.clone())
                .or_default();
            channel.observations += 1;
            channel.avg_roi += (actual - channel.avg_roi) / channel.observations as f64;
            stats.channel_count = stats.per_channel.len() as u64;

            let mut best: Option<(&String, f64)> = None;
            let mut worst: Option<(&String, f64)> = None;
            for (key, roi) in &stats.per_channel {
                if best.map(|(_, r)| roi.avg_roi > r).unwrap_or(true) {
                    best = Some((key, roi.avg_roi));
                }
                if worst.map(|(_, r)| roi.avg_roi < r).unwrap_or(true) {
                    worst = Some((key, roi.avg_roi));
                }
            }
            stats.best_channel_key = best.map(|(k, _)| k.clone());
            stats.best_channel_roi = best.map(|(_, r)| r).unwrap_or(0.0);
            stats.worst_channel_key = worst.map(|(k, _)| k.clone());
            stats.worst_channel_roi = worst.map(|(_, r)| r).unwrap_or(0.0);

            stats.consensus_strength = if stats.total_mentions > 1 && stats.avg_roi.abs() > 1e-12 {
                let variance = stats.m2 / (stats.total_mentions - 1) as f64;
                (1.0 - variance.sqrt() / stats.avg_roi).clamp(0.0, 1.0)
            } else {
                1.0
            };
        });

        self.dirty.lock().insert(event.channel_id.clone());
        debug!(
            channel = %event.channel_id,
            token = %event.token_key,
            actual = format!("{:.4}", actual),
            "learning updates applied"
        );
        Ok(())
    }

    /// Weighted blend over whichever levels have data; neutral 1.0 when no
    /// channel has any history.
    pub fn predict(&self, channel_id: &str, token_key: &str) -> Prediction {
        let channel = self.store.channel(channel_id);
        let overall = channel.as_ref().and_then(|c| c.expected_roi);
        let channel_token = channel
            .as_ref()
            .and_then(|c| c.tokens.get(token_key))
            .and_then(|t| t.expected_roi);
        let token_cross = self
            .store
            .cross_channel(token_key)
            .filter(|s| s.total_mentions > 0)
            .map(|s| s.avg_roi);

        let mut weight_sum = 0.0;
        let mut value_sum = 0.0;
        for (value, weight) in [
            (overall, WEIGHT_OVERALL),
            (channel_token, WEIGHT_CHANNEL_TOKEN),
            (token_cross, WEIGHT_TOKEN_CROSS),
        ] {
            if let Some(v) = value {
                weight_sum += weight;
                value_sum += weight * v;
            }
        }

        if weight_sum == 0.0 {
            return Prediction::neutral();
        }

        let expected = value_sum / weight_sum;
        if !expected.is_finite() {
            warn!(channel = %channel_id, token = %token_key, "non-finite prediction, using neutral");
            return Prediction::neutral();
        }

        let source = match (overall.is_some(), channel_token.is_some(), token_cross.is_some()) {
            (true, false, false) => PredictionSource::Overall,
            (false, true, false) => PredictionSource::ChannelToken,
            _ => PredictionSource::Blended,
        };

        Prediction {
            expected_roi: expected,
            source,
        }
    }
}

fn incremental_mean(mean: f64, sample: f64, n: u64) -> f64 {
    mean + (sample - mean) / n as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trajectory;

    fn engine() -> LearningEngine {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ReputationStore::new(dir.path().to_path_buf()));
        LearningEngine::new(0.1, store)
    }

    fn event(channel: &str, token: &str, ath: f64) -> TerminalEvent {
        TerminalEvent {
            signal_id: format!("{}:{}:1:abc", channel, token),
            channel_id: channel.to_string(),
            token_key: token.to_string(),
            ath_multiplier: ath,
            day_30_multiplier: Some(ath * 0.8),
            days_to_ath: 3.0,
            trajectory: Trajectory::Improved,
            predicted_roi: None,
        }
    }

    #[test]
    fn test_td_update_exact_value() {
        // E = 1.50, a = 3.252, α = 0.1 → 1.6752 exactly.
        let engine = engine();
        engine
            .apply_terminal(&event("c1", "ETH", 1.50), "Chan", 1_700_000_000)
            .unwrap();
        engine
            .apply_terminal(&event("c1", "ETH", 3.252), "Chan", 1_700_000_100)
            .unwrap();

        let rep = engine.store().channel("c1").unwrap();
        assert!((rep.expected_roi.unwrap() - 1.6752).abs() < 1e-12);
    }

    #[test]
    fn test_td_converges_to_constant_roi() {
        // Closed form: E_n = (1−α)^n · E_0 + (1 − (1−α)^n) · r*.
        let engine = engine();
        let e0 = 1.2;
        let r_star = 2.5;
        let alpha = 0.1f64;

        engine
            .apply_terminal(&event("c1", "ETH", e0), "Chan", 0)
            .unwrap();
        let n = 40;
        for i in 0..n {
            engine
                .apply_terminal(&event("c1", "ETH", r_star), "Chan", i as i64)
                .unwrap();
        }

        let decay = (1.0 - alpha).powi(n);
        let expected = decay * e0 + (1.0 - decay) * r_star;
        let rep = engine.store().channel("c1").unwrap();
        assert!((rep.expected_roi.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_blended_prediction_weights() {
        // overall 1.85, channel×token 3.112, cross-channel 2.376
        // → (0.4·1.85 + 0.5·3.112 + 0.1·2.376) / 1.0 = 2.4736.
        let engine = engine();
        engine.store().with_channel("c1", "Chan", |rep| {
            rep.expected_roi = Some(1.85);
            rep.tokens.insert(
                "AVICI".to_string(),
                crate::reputation::ChannelTokenStats {
                    expected_roi: Some(3.112),
                    ..Default::default()
                },
            );
        });
        engine.store().with_cross_channel("AVICI", |stats| {
            stats.total_mentions = 4;
            stats.avg_roi = 2.376;
        });

        let prediction = engine.predict("c1", "AVICI");
        assert!((prediction.expected_roi - 2.4736).abs() < 1e-12);
        assert_eq!(prediction.source, PredictionSource::Blended);
    }

    #[test]
    fn test_prediction_with_partial_levels() {
        let engine = engine();
        engine.store().with_channel("c1", "Chan", |rep| {
            rep.expected_roi = Some(2.0);
        });

        // Only the overall level: weights renormalize to it.
        let prediction = engine.predict("c1", "PEPE");
        assert_eq!(prediction.expected_roi, 2.0);
        assert_eq!(prediction.source, PredictionSource::Overall);

        // No history anywhere: neutral.
        let cold = engine.predict("c9", "PEPE");
        assert_eq!(cold.expected_roi, 1.0);
        assert_eq!(cold.source, PredictionSource::None);
    }

    #[test]
    fn test_cross_channel_best_and_worst() {
        let engine = engine();
        engine
            .apply_terminal(&event("good", "ETH", 3.0), "Good", 0)
            .unwrap();
        engine
            .apply_terminal(&event("bad", "ETH", 0.8), "Bad", 1)
            .unwrap();
        engine
            .apply_terminal(&event("good", "ETH", 3.4), "Good", 2)
            .unwrap();

        let stats = engine.store().cross_channel("ETH").unwrap();
        assert_eq!(stats.total_mentions, 3);
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.best_channel_key.as_deref(), Some("good"));
        assert!((stats.best_channel_roi - 3.2).abs() < 1e-12);
        assert_eq!(stats.worst_channel_key.as_deref(), Some("bad"));
        assert!((stats.worst_channel_roi - 0.8).abs() < 1e-12);
        assert!(stats.consensus_strength >= 0.0 && stats.consensus_strength <= 1.0);
    }

    #[test]
    fn test_prediction_error_tracking() {
        let engine = engine();
        let mut e = event("c1", "ETH", 2.0);
        e.predicted_roi = Some(1.5);
        engine.apply_terminal(&e, "Chan", 10).unwrap();

        let rep = engine.store().channel("c1").unwrap();
        assert_eq!(rep.prediction_count, 1);
        assert!((rep.mae - 0.5).abs() < 1e-12);
        assert_eq!(rep.prediction_history.len(), 1);

        let token = rep.tokens.get("ETH").unwrap();
        assert!((token.prediction_accuracy - 1.0 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_actual_is_rejected() {
        let engine = engine();
        let bad = event("c1", "ETH", f64::NAN);
        assert!(engine.apply_terminal(&bad, "Chan", 0).is_err());
        // Nothing was applied.
        assert!(engine.store().channel("c1").is_none());
    }
}
