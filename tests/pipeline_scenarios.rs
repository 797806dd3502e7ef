//! End-to-end pipeline scenarios against a scripted in-process price
//! provider: first-mention full history, fresh-start re-monitoring,
//! duplicate suppression, dead tokens, ambiguous symbols, the bootstrap's
//! learning seed pass, and live admission.

use async_trait::async_trait;
use callscope_backend::app::{process_mention, AppContext, Disposition, Mode};
use callscope_backend::bootstrap::BootstrapOrchestrator;
use callscope_backend::config::Config;
use callscope_backend::exports;
use callscope_backend::models::{
    day_bucket, Chain, Checkpoint, DailyBar, ExtractedMention, OutcomeCategory, PeakTiming,
    PriceReading, TokenRef, Trajectory, DAY_SECS,
};
use callscope_backend::price::{PriceCache, PriceDataService, ProviderRegistry, Resolver};
use callscope_backend::providers::{
    HistoricalPriceSource, OhlcSource, ProviderError, ProviderQuery, SpotPriceSource,
};
use callscope_backend::reputation::{LearningEngine, ReputationStore};
use callscope_backend::tracking::TrackingStore;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// In-memory provider scripted per token symbol: a daily bar timeline plus a
/// spot price. Unknown tokens report `NotFound`, the archive's "no data".
#[derive(Default)]
struct ScriptedProvider {
    bars: Mutex<HashMap<String, Vec<DailyBar>>>,
    spot: Mutex<HashMap<String, f64>>,
}

impl ScriptedProvider {
    fn set_bars(&self, symbol: &str, bars: Vec<DailyBar>) {
        self.bars.lock().insert(symbol.to_string(), bars);
    }

    fn set_spot(&self, symbol: &str, price: f64) {
        self.spot.lock().insert(symbol.to_string(), price);
    }

    fn key(query: &ProviderQuery) -> Result<String, ProviderError> {
        query
            .symbol
            .clone()
            .or_else(|| query.address.clone())
            .ok_or(ProviderError::NotFound)
    }
}

#[async_trait]
impl SpotPriceSource for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn current_price(
        &self,
        query: &ProviderQuery,
        _deadline: Instant,
    ) -> Result<PriceReading, ProviderError> {
        let key = Self::key(query)?;
        let price = self
            .spot
            .lock()
            .get(&key)
            .copied()
            .ok_or(ProviderError::NotFound)?;
        Ok(PriceReading {
            price,
            market_cap: None,
            liquidity: None,
            volume_24h: None,
            symbol_resolved: Some(key),
            source: "scripted",
        })
    }
}

#[async_trait]
impl HistoricalPriceSource for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn price_at(
        &self,
        query: &ProviderQuery,
        ts: i64,
        _deadline: Instant,
    ) -> Result<f64, ProviderError> {
        let key = Self::key(query)?;
        let bucket = day_bucket(ts);
        self.bars
            .lock()
            .get(&key)
            .and_then(|bars| bars.iter().find(|b| b.day_ts == bucket))
            .map(|b| b.close)
            .ok_or(ProviderError::NotFound)
    }
}

#[async_trait]
impl OhlcSource for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn daily_ohlc(
        &self,
        query: &ProviderQuery,
        from: i64,
        until: i64,
        _deadline: Instant,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        let key = Self::key(query)?;
        let bars: Vec<DailyBar> = self
            .bars
            .lock()
            .get(&key)
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.day_ts >= day_bucket(from) && b.day_ts <= until)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        if bars.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(bars)
    }
}

struct Harness {
    ctx: Arc<AppContext>,
    provider: Arc<ScriptedProvider>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };

    let provider = Arc::new(ScriptedProvider::default());
    let registry = ProviderRegistry {
        address_spot: vec![provider.clone()],
        symbol_spot: vec![provider.clone()],
        historical: vec![provider.clone()],
        ohlc: vec![provider.clone()],
        metadata: vec![],
    };
    let cache = Arc::new(PriceCache::new(config.price_cache_dir()));
    let price = Arc::new(PriceDataService::new(
        Arc::new(Resolver::default()),
        registry,
        cache,
        config.schedule.clone(),
    ));

    let store = Arc::new(
        TrackingStore::open(config.active_tracking_path(), config.completed_history_path())
            .unwrap(),
    );
    let reputation = Arc::new(ReputationStore::new(config.reputation_dir()));
    let learning = Arc::new(LearningEngine::new(config.td_alpha, reputation));

    let ctx = AppContext::from_parts(config, price, store, learning);
    Harness {
        ctx,
        provider,
        _dir: dir,
    }
}

fn mention(
    message_id: i64,
    channel: &str,
    symbol: &str,
    entry_ts: i64,
    explicit_prefix: bool,
) -> ExtractedMention {
    ExtractedMention {
        message_id,
        channel_id: channel.to_string(),
        channel_name: format!("{} Calls", channel),
        token_ref: TokenRef::from_symbol(Chain::Evm, symbol),
        entry_time: Utc.timestamp_opt(entry_ts, 0).unwrap(),
        explicit_prefix,
    }
}

/// The S1 price script: entry 1000, peak 1600 on day 15, day-7 at 1100,
/// day-30 close 1200.
fn script_eth_history(provider: &ScriptedProvider, entry: i64) {
    let bars: Vec<DailyBar> = (0..=30)
        .map(|d| {
            let (high, close) = match d {
                0 => (1000.0, 1000.0),
                7 => (1100.0, 1100.0),
                15 => (1600.0, 1300.0),
                30 => (1250.0, 1200.0),
                _ => (1050.0, 1050.0),
            };
            DailyBar {
                day_ts: entry + d * DAY_SECS,
                open: close,
                high,
                low: close * 0.9,
                close,
            }
        })
        .collect();
    provider.set_bars("ETH", bars);
}

#[tokio::test]
async fn test_s1_first_mention_full_history() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 90 * DAY_SECS);
    script_eth_history(&h.provider, entry);

    let disposition = process_mention(&h.ctx, &mention(1, "C", "ETH", entry, false), now, Mode::Backfill)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::AdmittedTerminal);

    let completed = h.ctx.store.completed_for("ETH");
    assert_eq!(completed.len(), 1);
    let outcome = &completed[0];
    assert_eq!(outcome.signal_number, 1);
    assert_eq!(outcome.entry_price, 1000.0);
    assert_eq!(outcome.ath_multiplier(), 1.6);
    assert_eq!(outcome.day_7_multiplier, Some(1.1));
    assert_eq!(outcome.day_30_multiplier, Some(1.2));
    assert_eq!(outcome.days_to_ath, 15.0);
    assert_eq!(outcome.peak_timing, Some(PeakTiming::LatePeaker));
    assert_eq!(outcome.trajectory, Some(Trajectory::Improved));
    assert_eq!(outcome.outcome_category, Some(OutcomeCategory::Good));
    assert!(outcome.is_winner);
    assert!(h.ctx.store.get_active("ETH").is_none());
}

#[tokio::test]
async fn test_s2_s3_remention_and_duplicate() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 90 * DAY_SECS);
    script_eth_history(&h.provider, entry);

    process_mention(&h.ctx, &mention(1, "C", "ETH", entry, false), now, Mode::Backfill)
        .await
        .unwrap();
    let first_id = h.ctx.store.completed_for("ETH")[0].signal_id.clone();

    // S2: a fresh mention 5 days ago opens signal 2 with a new entry price.
    let entry2 = day_bucket(now - 5 * DAY_SECS);
    let recent: Vec<DailyBar> = (0..=5)
        .map(|d| DailyBar {
            day_ts: entry2 + d * DAY_SECS,
            open: 1300.0,
            high: 1350.0,
            low: 1280.0,
            close: 1300.0,
        })
        .collect();
    {
        let mut bars = h.provider.bars.lock();
        bars.get_mut("ETH").unwrap().extend(recent);
    }

    let disposition = process_mention(
        &h.ctx,
        &mention(2, "C", "ETH", entry2, false),
        now,
        Mode::Backfill,
    )
    .await
    .unwrap();
    assert_eq!(disposition, Disposition::AdmittedInProgress);

    let active = h.ctx.store.get_active("ETH").unwrap();
    assert_eq!(active.signal_number, 2);
    assert_eq!(active.entry_price, 1300.0);
    assert_eq!(active.previous_signal_ids, vec![first_id]);
    assert!(active.checkpoints.contains_key(&Checkpoint::D3));
    assert!(!active.checkpoints.contains_key(&Checkpoint::D7));

    // S3: mention again while a signal is active → duplicate, no new state.
    let disposition = process_mention(
        &h.ctx,
        &mention(3, "C", "ETH", day_bucket(now - 2 * DAY_SECS), false),
        now,
        Mode::Backfill,
    )
    .await
    .unwrap();
    assert_eq!(disposition, Disposition::Duplicate);
    assert_eq!(h.ctx.store.completed_for("ETH").len(), 1);
    assert_eq!(h.ctx.store.get_active("ETH").unwrap().signal_number, 2);
}

#[tokio::test]
async fn test_dead_token_is_skipped_with_reason() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 40 * DAY_SECS);

    let disposition = process_mention(
        &h.ctx,
        &mention(1, "C", "GONE", entry, false),
        now,
        Mode::Backfill,
    )
    .await
    .unwrap();
    assert_eq!(disposition, Disposition::SkippedDeadToken);
    assert!(h.ctx.store.get_active("GONE").is_none());
    assert_eq!(h.ctx.stats.snapshot().skipped_dead_token, 1);
}

#[tokio::test]
async fn test_ambiguous_symbol_requires_prefix() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 40 * DAY_SECS);
    h.provider.set_bars(
        "LINK",
        (0..=30)
            .map(|d| DailyBar {
                day_ts: entry + d * DAY_SECS,
                open: 10.0,
                high: 11.0,
                low: 9.0,
                close: 10.0,
            })
            .collect(),
    );

    let bare = process_mention(&h.ctx, &mention(1, "C", "LINK", entry, false), now, Mode::Backfill)
        .await
        .unwrap();
    assert!(matches!(bare, Disposition::SkippedUnresolvable(_)));

    let prefixed =
        process_mention(&h.ctx, &mention(2, "C", "LINK", entry, true), now, Mode::Backfill)
            .await
            .unwrap();
    assert_eq!(prefixed, Disposition::AdmittedTerminal);
}

#[tokio::test]
async fn test_bootstrap_run_seeds_learning_and_cleans_up() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 90 * DAY_SECS);
    script_eth_history(&h.provider, entry);

    let mentions = vec![mention(1, "C", "ETH", entry, false)];
    BootstrapOrchestrator::new(h.ctx.clone())
        .run(mentions)
        .await
        .unwrap();

    // Progress file deleted on clean finish.
    assert!(!h.ctx.config.bootstrap_progress_path().exists());

    // One terminal outcome seeded all levels: E_channel = a = 1.6.
    let rep = h.ctx.learning.store().channel("C").unwrap();
    assert_eq!(rep.expected_roi, Some(1.6));
    assert_eq!(rep.total_signals, 1);
    assert_eq!(rep.reputation_tier.as_str(), "Unreliable");

    let cross = h.ctx.learning.store().cross_channel("ETH").unwrap();
    assert_eq!(cross.total_mentions, 1);
    assert_eq!(cross.best_channel_key.as_deref(), Some("C"));

    // Read-models come out consistent.
    let snapshot = h.ctx.store.snapshot();
    let rows = exports::messages(&snapshot, h.ctx.learning.store());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].channel_expected_roi_overall, Some(1.6));
    let rankings = exports::channel_rankings(h.ctx.learning.store());
    assert_eq!(rankings.len(), 1);
    assert_eq!(rankings[0].total_signals, 1);

    // Reputation survived to disk.
    let reloaded = ReputationStore::new(h.ctx.config.reputation_dir());
    reloaded.load().unwrap();
    assert_eq!(reloaded.channel("C").unwrap().expected_roi, Some(1.6));
}

#[tokio::test]
async fn test_bootstrap_resume_skips_processed_messages() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 90 * DAY_SECS);
    script_eth_history(&h.provider, entry);

    // An in-flight progress file from an interrupted run says message 1 was
    // already handled; the resumed run must not touch it again.
    std::fs::write(
        h.ctx.config.bootstrap_progress_path(),
        serde_json::json!({
            "version": 1,
            "total_messages": 2,
            "processed_messages": 1,
            "last_processed_message_id": 1,
            "last_checkpoint_time": now,
            "successful_outcomes": 1,
            "failed_outcomes": 0
        })
        .to_string(),
    )
    .unwrap();

    BootstrapOrchestrator::new(h.ctx.clone())
        .run(vec![mention(1, "C", "ETH", entry, false)])
        .await
        .unwrap();

    // Message 1 was skipped by the resume filter, so nothing was admitted,
    // and the progress file is gone after the clean finish.
    assert!(h.ctx.store.completed_for("ETH").is_empty());
    assert!(h.ctx.store.get_active("ETH").is_none());
    assert!(!h.ctx.config.bootstrap_progress_path().exists());
}

#[tokio::test]
async fn test_live_admission_and_prediction_source() {
    let h = harness();
    let now = Utc::now().timestamp();
    let entry = day_bucket(now - 90 * DAY_SECS);
    script_eth_history(&h.provider, entry);

    // History first, so the channel has learned state.
    BootstrapOrchestrator::new(h.ctx.clone())
        .run(vec![mention(1, "C", "ETH", entry, false)])
        .await
        .unwrap();

    // A live mention of the same token rides the blended/overall estimate.
    h.provider.set_spot("ETH", 1500.0);
    let disposition = process_mention(
        &h.ctx,
        &mention(9, "C", "ETH", now, false),
        now,
        Mode::Live,
    )
    .await
    .unwrap();
    assert_eq!(disposition, Disposition::AdmittedInProgress);

    let active = h.ctx.store.get_active("ETH").unwrap();
    assert_eq!(active.entry_price, 1500.0);
    assert_eq!(active.signal_number, 2);
    let predicted = active.predicted_roi.unwrap();
    assert!(predicted > 1.0, "learned state should lift the prediction");
    assert!(active.prediction_source.is_some());
}
