//! Shared application state and the mention-admission pipeline.
//!
//! Both orchestrators run the same sequence for a fresh mention: resolve,
//! dedup against the store, predict, fetch an entry price, construct the
//! signal, drive it through the lifecycle engine. The per-token mutex is
//! held across the whole sequence, including the active→completed
//! transition, so one worker owns a signal for the duration of an operation.

use crate::config::Config;
use crate::models::{Checkpoint, ExtractedMention, SignalOutcome, TerminalEvent};
use crate::price::{PriceDataService, PriceError, ResolvedToken};
use crate::reputation::{scoring, LearningEngine, ReputationStore};
use crate::stats::RunStats;
use crate::tracking::{LifecycleEngine, StoreError, TrackingStore};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Which driver is admitting the mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Historical messages: entry price at the message timestamp, forward
    /// window from the archives.
    Backfill,
    /// Fresh messages: entry price is the live price; the clock is trusted,
    /// forward windows are never touched.
    Live,
}

/// What happened to one mention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Duplicate,
    SkippedUnresolvable(String),
    SkippedPriceUnavailable,
    SkippedDeadToken,
    AdmittedInProgress,
    AdmittedTerminal,
}

pub struct AppContext {
    pub config: Config,
    pub price: Arc<PriceDataService>,
    pub store: Arc<TrackingStore>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub learning: Arc<LearningEngine>,
    pub stats: Arc<RunStats>,
    token_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: AtomicBool,
    shutdown_notify: tokio::sync::Notify,
}

impl AppContext {
    pub fn init(config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

        let price = Arc::new(PriceDataService::from_config(&config)?);

        let store = Arc::new(
            TrackingStore::open(config.active_tracking_path(), config.completed_history_path())
                .context("load tracking store")?,
        );

        let reputation = Arc::new(ReputationStore::new(config.reputation_dir()));
        reputation.load().context("load reputation store")?;
        let learning = Arc::new(LearningEngine::new(config.td_alpha, reputation));

        let lifecycle = Arc::new(LifecycleEngine::new(config.schedule.clone()));

        Ok(Arc::new(Self {
            config,
            price,
            store,
            lifecycle,
            learning,
            stats: Arc::new(RunStats::new()),
            token_locks: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: tokio::sync::Notify::new(),
        }))
    }

    /// Assemble from pre-built components (tests inject scripted providers
    /// this way; `init` is the production path).
    pub fn from_parts(
        config: Config,
        price: Arc<PriceDataService>,
        store: Arc<TrackingStore>,
        learning: Arc<LearningEngine>,
    ) -> Arc<Self> {
        let lifecycle = Arc::new(LifecycleEngine::new(config.schedule.clone()));
        Arc::new(Self {
            config,
            price,
            store,
            lifecycle,
            learning,
            stats: Arc::new(RunStats::new()),
            token_locks: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait_shutdown(&self) {
        while !self.shutting_down() {
            self.shutdown_notify.notified().await;
        }
    }

    /// One mutex per token key, shared by every worker touching that signal.
    pub fn token_lock(&self, token_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.token_locks
            .lock()
            .entry(token_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Recompute aggregates for channels dirtied by learning updates, then
    /// persist the reputation stores.
    pub fn refresh_reputation(&self, now: i64) -> Result<()> {
        let dirty = self.learning.take_dirty_channels();
        if dirty.is_empty() {
            return Ok(());
        }
        let snapshot = self.store.snapshot();
        for channel_id in dirty {
            self.learning.store().with_channel(&channel_id, "", |rep| {
                scoring::recompute_channel(
                    rep,
                    &snapshot,
                    self.config.winner_ath_threshold,
                    self.config.min_signals_for_reputation,
                    now,
                );
            });
        }
        self.learning
            .store()
            .save()
            .context("persist reputation store")
    }

    /// Flush everything that buffers in memory.
    pub fn persist_all(&self, now: i64) -> Result<()> {
        self.price.cache().flush().context("flush price cache")?;
        self.refresh_reputation(now)?;
        self.learning.store().save().context("save reputation")?;
        Ok(())
    }

    /// Archive a terminal signal and apply learning, honoring the
    /// backfill's deferred-learning contract.
    pub fn commit_terminal(
        &self,
        outcome: &SignalOutcome,
        event: &TerminalEvent,
        mode: Mode,
        now: i64,
    ) -> Result<(), StoreError> {
        self.store.update_active(outcome)?;
        self.store.archive(&outcome.token_key())?;
        RunStats::bump(&self.stats.archived);

        // Backfill seeds learning in one chronological pass at the end of
        // the batch; live applies immediately.
        if mode == Mode::Live {
            if let Err(e) = self
                .learning
                .apply_terminal(event, &outcome.channel_name, now)
            {
                warn!(signal = %outcome.signal_id, error = %e, "learning update reverted");
            }
        }
        Ok(())
    }
}

/// Why admission could not finish.
#[derive(Debug)]
pub enum ProcessError {
    /// `ProviderAllFailed` / `RateBudgetExhausted`: pause the batch and
    /// resume once.
    Pause(PriceError),
    /// Store failures are fatal after their internal retry.
    Store(StoreError),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pause(e) => write!(f, "batch pause: {}", e),
            Self::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<PriceError> for ProcessError {
    fn from(e: PriceError) -> Self {
        Self::Pause(e)
    }
}

impl From<StoreError> for ProcessError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Run one mention through admission: dedup, prediction, entry price, first
/// lifecycle advance.
///
/// Data-level misses (dead token, no price, duplicate) are dispositions,
/// not failures; `Err` means pause-the-batch or a fatal store fault.
pub async fn process_mention(
    ctx: &AppContext,
    mention: &ExtractedMention,
    now: i64,
    mode: Mode,
) -> Result<Disposition, ProcessError> {
    RunStats::bump(&ctx.stats.processed);
    let entry_ts = mention.entry_ts();

    let resolved = match ctx
        .price
        .resolver()
        .resolve(&mention.token_ref, mention.explicit_prefix)
    {
        Ok(resolved) => resolved,
        Err(e) => {
            RunStats::bump(&ctx.stats.skipped_unresolvable);
            info!(message = mention.message_id, error = %e, "⏭️ mention skipped: unresolvable");
            return Ok(Disposition::SkippedUnresolvable(e.to_string()));
        }
    };

    let lock = ctx.token_lock(&resolved.token_key);
    let _guard = lock.lock().await;

    let class = ctx.store.classify_mention(&resolved.token_key);
    if class.is_duplicate {
        RunStats::bump(&ctx.stats.duplicates);
        info!(
            message = mention.message_id,
            token = %resolved.token_key,
            "⏭️ mention skipped: already tracking"
        );
        return Ok(Disposition::Duplicate);
    }

    let prediction = ctx
        .learning
        .predict(&mention.channel_id, &resolved.token_key);

    let entry_price = match mode {
        Mode::Backfill => ctx.price.get_at(&resolved, entry_ts, now).await,
        Mode::Live => ctx
            .price
            .get_current(&resolved)
            .await
            .map(|reading| reading.price),
    };
    let entry_price = match entry_price {
        Ok(price) => price,
        Err(PriceError::DeadToken) => {
            RunStats::bump(&ctx.stats.skipped_dead_token);
            info!(message = mention.message_id, token = %resolved.token_key, "⏭️ mention skipped: dead token");
            return Ok(Disposition::SkippedDeadToken);
        }
        Err(PriceError::PriceUnavailable) => {
            RunStats::bump(&ctx.stats.skipped_price_unavailable);
            info!(message = mention.message_id, token = %resolved.token_key, "⏭️ mention skipped: no entry price");
            return Ok(Disposition::SkippedPriceUnavailable);
        }
        Err(e) => return Err(e.into()),
    };

    let mut outcome = SignalOutcome::new(
        &mention.channel_id,
        &mention.channel_name,
        resolved.token_ref.clone(),
        class.next_signal_number,
        class.previous_signal_ids,
        mention.message_id,
        entry_ts,
        entry_price,
    );
    outcome.predicted_roi = Some(prediction.expected_roi);
    outcome.prediction_source = Some(prediction.source);

    let disposition = match mode {
        Mode::Backfill => admit_backfill(ctx, &resolved, outcome, now).await?,
        Mode::Live => admit_live(ctx, outcome, now)?,
    };
    RunStats::bump(&ctx.stats.admitted);
    Ok(disposition)
}

/// Backfill admission: forward window, checkpoint drive, immediate archive
/// when the window already closed.
async fn admit_backfill(
    ctx: &AppContext,
    resolved: &ResolvedToken,
    mut outcome: SignalOutcome,
    now: i64,
) -> Result<Disposition, ProcessError> {
    let entry_ts = outcome.entry_time;
    let window_end = entry_ts + ctx.lifecycle.schedule().terminal_offset();
    let until = now.min(window_end);

    let series = match ctx.price.get_forward_window(resolved, entry_ts, until).await {
        Ok(series) => series,
        Err(PriceError::DeadToken) => {
            // Entry price existed but the history vanished: terminal CRASH.
            let event = ctx.lifecycle.finalize_dead(&mut outcome, now);
            ctx.store.add_active(outcome.clone())?;
            ctx.commit_terminal(&outcome, &event, Mode::Backfill, now)?;
            return Ok(Disposition::AdmittedTerminal);
        }
        Err(e) => return Err(e.into()),
    };

    // Checkpoint prices resolve through the cache the forward window just
    // filled; a miss becomes a null-price sentinel, never a blocker.
    let mut checkpoint_prices: BTreeMap<Checkpoint, Option<f64>> = BTreeMap::new();
    for checkpoint in ctx.price.calculate_smart_checkpoints(entry_ts, now) {
        let capture_ts = entry_ts + ctx.lifecycle.schedule().offset(checkpoint);
        let price = match ctx.price.get_at(resolved, capture_ts, now).await {
            Ok(price) => Some(price),
            Err(PriceError::RateBudgetExhausted) => {
                return Err(PriceError::RateBudgetExhausted.into())
            }
            Err(_) => None,
        };
        checkpoint_prices.insert(checkpoint, price);
    }

    let event = ctx
        .lifecycle
        .advance_backfill(&mut outcome, &series, &checkpoint_prices, now);

    ctx.store.add_active(outcome.clone())?;

    match event {
        Some(event) => {
            ctx.commit_terminal(&outcome, &event, Mode::Backfill, now)?;
            Ok(Disposition::AdmittedTerminal)
        }
        None => Ok(Disposition::AdmittedInProgress),
    }
}

/// Live admission: trust the clock, no forward windows.
fn admit_live(
    ctx: &AppContext,
    mut outcome: SignalOutcome,
    now: i64,
) -> Result<Disposition, ProcessError> {
    let entry_price = outcome.entry_price;
    let event = ctx.lifecycle.advance_live(&mut outcome, now, Some(entry_price));

    ctx.store.add_active(outcome.clone())?;

    match event {
        Some(event) => {
            ctx.commit_terminal(&outcome, &event, Mode::Live, now)?;
            Ok(Disposition::AdmittedTerminal)
        }
        None => Ok(Disposition::AdmittedInProgress),
    }
}
