//! Signal lifecycle engine.
//!
//! Owns every mutation of a `SignalOutcome` between admission and archive:
//! monotone ATH tracking, smart-checkpoint capture, and the terminal
//! classification. The engine is synchronous; orchestrators fetch prices and
//! feed observations in chronological order.

use crate::models::{
    Checkpoint, CheckpointData, CheckpointSchedule, OhlcSeries, OutcomeCategory, PeakTiming,
    SignalOutcome, SignalStatus, TerminalEvent, Trajectory, DAY_SECS,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// ATH-multiplier thresholds for terminal classification.
const MOON_ATH: f64 = 5.0;
const WINNER_ATH: f64 = 2.0;
const GOOD_ATH: f64 = 1.5;
const BREAK_EVEN_ATH: f64 = 1.0;
/// A final multiplier below this is a crash regardless of the peak.
const CRASH_DAY30: f64 = 0.5;

const EARLY_PEAK_DAYS: f64 = 7.0;
const SEVERITY_WARN_PCT: f64 = 50.0;

pub struct LifecycleEngine {
    schedule: CheckpointSchedule,
}

impl LifecycleEngine {
    pub fn new(schedule: CheckpointSchedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &CheckpointSchedule {
        &self.schedule
    }

    /// Feed one price observation. Corrupt observations (`price <= 0`) are
    /// dropped; returns whether the observation was applied.
    pub fn observe_price(&self, outcome: &mut SignalOutcome, ts: i64, price: f64) -> bool {
        if !price.is_finite() || price <= 0.0 {
            warn!(signal = %outcome.signal_id, price, "dropping corrupt price observation");
            return false;
        }
        if price > outcome.ath_price {
            outcome.ath_price = price;
            outcome.ath_time = ts.max(outcome.entry_time);
            outcome.days_to_ath =
                (outcome.ath_time - outcome.entry_time).max(0) as f64 / DAY_SECS as f64;
        }
        outcome.current_price = price;
        outcome.current_time = ts;
        true
    }

    /// Fill one checkpoint slot. `price` is None when upstream had no data;
    /// the slot still counts as reached and progress is never blocked.
    pub fn capture_checkpoint(
        &self,
        outcome: &mut SignalOutcome,
        checkpoint: Checkpoint,
        captured_at: i64,
        price: Option<f64>,
    ) {
        if outcome.checkpoints.contains_key(&checkpoint) {
            return;
        }
        if let Some(p) = price {
            self.observe_price(outcome, captured_at, p);
        }
        let data = CheckpointData::reached(captured_at, price, outcome.entry_price);

        if checkpoint == Checkpoint::D7 {
            outcome.day_7_price = data.price;
            outcome.day_7_multiplier = data.roi_multiplier;
            outcome.day_7_classification = Some(classify_day7(outcome.ath_multiplier()));
        }

        debug!(
            signal = %outcome.signal_id,
            checkpoint = checkpoint.as_str(),
            price = price.unwrap_or(f64::NAN),
            "checkpoint captured"
        );
        outcome.checkpoints.insert(checkpoint, data);
    }

    /// Backfill drive: walk the daily-high series and the elapsed checkpoints
    /// in one chronological pass, so the ATH-so-far is correct at each
    /// capture. Returns the terminal event if the 30-day slot was reached.
    pub fn advance_backfill(
        &self,
        outcome: &mut SignalOutcome,
        series: &OhlcSeries,
        checkpoint_prices: &BTreeMap<Checkpoint, Option<f64>>,
        now: i64,
    ) -> Option<TerminalEvent> {
        let window_end = outcome.entry_time + self.schedule.terminal_offset();
        let horizon = now.min(window_end);
        let mut bar_idx = 0;

        for checkpoint in self.schedule.elapsed(outcome.entry_time, now) {
            let capture_ts = outcome.entry_time + self.schedule.offset(checkpoint);
            while bar_idx < series.bars.len() && series.bars[bar_idx].day_ts <= capture_ts {
                let bar = &series.bars[bar_idx];
                if bar.day_ts <= horizon {
                    self.observe_price(outcome, bar.day_ts.max(outcome.entry_time), bar.high);
                    self.observe_price(outcome, bar.day_ts.max(outcome.entry_time), bar.close);
                }
                bar_idx += 1;
            }
            let price = checkpoint_prices.get(&checkpoint).copied().flatten();
            self.capture_checkpoint(outcome, checkpoint, capture_ts, price);
        }

        while bar_idx < series.bars.len() && series.bars[bar_idx].day_ts <= horizon {
            let bar = &series.bars[bar_idx];
            self.observe_price(outcome, bar.day_ts.max(outcome.entry_time), bar.high);
            self.observe_price(outcome, bar.day_ts.max(outcome.entry_time), bar.close);
            bar_idx += 1;
        }

        if outcome.checkpoints.contains_key(&Checkpoint::D30) {
            Some(self.finalize(outcome))
        } else {
            None
        }
    }

    /// Live drive: one current-price observation, then capture every elapsed
    /// checkpoint that is still open using that observation. A checkpoint
    /// firing late is captured with the price at the capture moment.
    pub fn advance_live(
        &self,
        outcome: &mut SignalOutcome,
        now: i64,
        current_price: Option<f64>,
    ) -> Option<TerminalEvent> {
        if let Some(price) = current_price {
            self.observe_price(outcome, now, price);
        }

        for checkpoint in self.schedule.elapsed(outcome.entry_time, now) {
            if !outcome.checkpoints.contains_key(&checkpoint) {
                self.capture_checkpoint(outcome, checkpoint, now, current_price);
            }
        }

        if outcome.checkpoints.contains_key(&Checkpoint::D30) {
            Some(self.finalize(outcome))
        } else {
            None
        }
    }

    /// Terminal transition once the 30-day checkpoint is captured.
    fn finalize(&self, outcome: &mut SignalOutcome) -> TerminalEvent {
        let day30 = outcome
            .checkpoints
            .get(&Checkpoint::D30)
            .cloned()
            .unwrap_or_else(|| {
                CheckpointData::reached(
                    outcome.entry_time + self.schedule.terminal_offset(),
                    None,
                    outcome.entry_price,
                )
            });

        // A null 30-day slot falls back to the last observed price so the
        // final multiplier is still meaningful.
        outcome.day_30_price = day30.price.or(Some(outcome.current_price));
        outcome.day_30_multiplier = day30
            .roi_multiplier
            .or(Some(outcome.current_multiplier()));

        let ath = outcome.ath_multiplier();
        let d30 = outcome.day_30_multiplier.unwrap_or(0.0);
        let d7 = outcome.day_7_multiplier;

        let category = classify_terminal(ath, d30);
        outcome.day_30_classification = Some(category);
        outcome.outcome_category = Some(category);
        outcome.is_winner = category.is_winner();

        // Null day-7 data is tolerated: trajectory defaults to improved with
        // zero severity.
        let (trajectory, severity) = match d7 {
            Some(d7) if d7 > 0.0 => {
                if d30 < d7 {
                    (Trajectory::Crashed, ((d7 - d30) / d7 * 100.0).max(0.0))
                } else {
                    (Trajectory::Improved, 0.0)
                }
            }
            _ => (Trajectory::Improved, 0.0),
        };
        outcome.trajectory = Some(trajectory);
        outcome.crash_severity_pct = Some(severity);

        outcome.peak_timing = Some(if outcome.days_to_ath <= EARLY_PEAK_DAYS {
            PeakTiming::EarlyPeaker
        } else {
            PeakTiming::LatePeaker
        });

        outcome.status = SignalStatus::Completed;

        if severity > SEVERITY_WARN_PCT {
            warn!(
                signal = %outcome.signal_id,
                severity_pct = format!("{:.1}", severity),
                "post-peak collapse exceeded half the day-7 value"
            );
        }

        metrics::counter!("signals_terminal", 1, "category" => category.as_str());
        self.terminal_event(outcome)
    }

    /// Terminal path for a token whose history disappeared upstream.
    pub fn finalize_dead(&self, outcome: &mut SignalOutcome, now: i64) -> TerminalEvent {
        let slot_ts = now.max(outcome.entry_time + self.schedule.terminal_offset());
        self.capture_checkpoint(outcome, Checkpoint::D30, slot_ts, None);
        outcome.day_30_price = None;
        outcome.day_30_multiplier = Some(0.0);
        outcome.day_30_classification = Some(OutcomeCategory::Crash);
        outcome.outcome_category = Some(OutcomeCategory::Crash);
        outcome.is_winner = false;
        outcome.trajectory = Some(Trajectory::Crashed);
        outcome.crash_severity_pct = Some(100.0);
        outcome.peak_timing = Some(if outcome.days_to_ath <= EARLY_PEAK_DAYS {
            PeakTiming::EarlyPeaker
        } else {
            PeakTiming::LatePeaker
        });
        outcome.provenance = Some("dead token: archives report no data".to_string());
        outcome.status = SignalStatus::Completed;

        metrics::counter!("signals_terminal", 1, "category" => OutcomeCategory::Crash.as_str());
        self.terminal_event(outcome)
    }

    /// Escalation path: three consecutive terminal-attempt failures let the
    /// orchestrator close the signal as a LOSER, with provenance, never
    /// silently.
    pub fn force_close(
        &self,
        outcome: &mut SignalOutcome,
        now: i64,
        note: impl Into<String>,
    ) -> TerminalEvent {
        let note = note.into();
        warn!(signal = %outcome.signal_id, note = %note, "force-closing signal");

        let slot_ts = now.max(outcome.entry_time + self.schedule.terminal_offset());
        self.capture_checkpoint(outcome, Checkpoint::D30, slot_ts, None);
        outcome.day_30_price = Some(outcome.current_price);
        outcome.day_30_multiplier = Some(outcome.current_multiplier());
        outcome.day_30_classification = Some(OutcomeCategory::Loser);
        outcome.outcome_category = Some(OutcomeCategory::Loser);
        outcome.is_winner = false;
        outcome.trajectory = Some(Trajectory::Improved);
        outcome.crash_severity_pct = Some(0.0);
        outcome.peak_timing = Some(if outcome.days_to_ath <= EARLY_PEAK_DAYS {
            PeakTiming::EarlyPeaker
        } else {
            PeakTiming::LatePeaker
        });
        outcome.provenance = Some(note);
        outcome.status = SignalStatus::Completed;

        metrics::counter!("signals_terminal", 1, "category" => OutcomeCategory::Loser.as_str());
        self.terminal_event(outcome)
    }

    fn terminal_event(&self, outcome: &SignalOutcome) -> TerminalEvent {
        TerminalEvent {
            signal_id: outcome.signal_id.clone(),
            channel_id: outcome.channel_id.clone(),
            token_key: outcome.token_key(),
            ath_multiplier: outcome.ath_multiplier(),
            day_30_multiplier: outcome.day_30_multiplier,
            days_to_ath: outcome.days_to_ath,
            trajectory: outcome.trajectory.unwrap_or(Trajectory::Improved),
            predicted_roi: outcome.predicted_roi,
        }
    }
}

/// Day-30 classification. The crash floor overrides everything else.
fn classify_terminal(ath: f64, day_30: f64) -> OutcomeCategory {
    if day_30 < CRASH_DAY30 {
        return OutcomeCategory::Crash;
    }
    if ath >= MOON_ATH {
        return OutcomeCategory::Moon;
    }
    if ath >= WINNER_ATH && day_30 >= 1.0 {
        return OutcomeCategory::Winner;
    }
    if ath >= GOOD_ATH && day_30 >= 0.9 {
        return OutcomeCategory::Good;
    }
    if ath >= BREAK_EVEN_ATH && day_30 >= 0.9 {
        return OutcomeCategory::BreakEven;
    }
    OutcomeCategory::Loser
}

/// Day-7 classification uses only the ATH-so-far; the final-multiplier
/// categories (BREAK-EVEN, CRASH) cannot be emitted yet.
fn classify_day7(ath_so_far: f64) -> OutcomeCategory {
    if ath_so_far >= MOON_ATH {
        OutcomeCategory::Moon
    } else if ath_so_far >= WINNER_ATH {
        OutcomeCategory::Winner
    } else if ath_so_far >= GOOD_ATH {
        OutcomeCategory::Good
    } else {
        OutcomeCategory::Loser
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod lifecycle_tests;
