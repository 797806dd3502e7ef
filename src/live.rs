//! Live orchestrator: periodic advancement of in-progress signals.
//!
//! Each cycle walks the active set with a bounded worker pool, captures
//! newly reached checkpoints at the current price, archives signals that hit
//! the 30-day mark, and saves after each archival. New mentions from the
//! extraction feed run the same admission pipeline as the bootstrap, minus
//! forward windows since live mode trusts the clock.

use crate::app::{process_mention, AppContext, Mode, ProcessError};
use crate::models::ExtractedMention;
use crate::price::PriceError;
use crate::stats::RunStats;
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct LiveOrchestrator {
    ctx: Arc<AppContext>,
}

impl LiveOrchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Run until shutdown. `mention_rx` is the optional live extraction
    /// feed; cycles fire on the configured period regardless.
    pub async fn run(&self, mention_rx: Option<mpsc::Receiver<ExtractedMention>>) -> Result<()> {
        let ctx = self.ctx.clone();
        let mut mention_rx = mention_rx;
        let mut ticker = tokio::time::interval(ctx.config.live_cycle_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            period_secs = ctx.config.live_cycle_period.as_secs(),
            workers = ctx.config.worker_pool_size,
            "🔄 live orchestrator started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.guarded_cycle().await?;
                }
                mention = recv_mention(&mut mention_rx) => {
                    match mention {
                        Some(mention) => self.admit(&mention).await,
                        None => mention_rx = None,
                    }
                }
                _ = ctx.wait_shutdown() => {}
            }

            if ctx.shutting_down() {
                break;
            }
        }

        let now = Utc::now().timestamp();
        self.ctx.persist_all(now).context("persist on shutdown")?;
        self.ctx.stats.log_summary("live");
        info!("live orchestrator stopped");
        Ok(())
    }

    /// One cycle, bounded by the shutdown grace period: in-flight work gets
    /// 30 s to finish naturally, then the cycle is abandoned and state is
    /// persisted by the caller.
    async fn guarded_cycle(&self) -> Result<()> {
        let ctx = self.ctx.clone();
        let cycle = self.cycle();
        tokio::pin!(cycle);

        tokio::select! {
            result = &mut cycle => result,
            _ = async {
                ctx.wait_shutdown().await;
                sleep(SHUTDOWN_GRACE).await;
            } => {
                warn!("shutdown grace elapsed; abandoning in-flight cycle");
                Ok(())
            }
        }
    }

    /// Advance every active signal through the bounded worker pool.
    async fn cycle(&self) -> Result<()> {
        let ctx = &self.ctx;
        let active = ctx.store.active_signals();
        if active.is_empty() {
            debug!("live cycle: nothing active");
            return Ok(());
        }

        info!(signals = active.len(), "live cycle started");
        let semaphore = Arc::new(Semaphore::new(ctx.config.worker_pool_size));
        let mut workers = FuturesUnordered::new();

        for signal in active {
            if ctx.shutting_down() {
                break;
            }
            let ctx = self.ctx.clone();
            let semaphore = semaphore.clone();
            let token_key = signal.token_key();
            workers.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let result = advance_signal(&ctx, &token_key).await;
                (token_key, result)
            });
        }

        let mut budget_exhausted = false;
        while let Some((token_key, result)) = workers.next().await {
            match result {
                Ok(()) => {}
                Err(ProcessError::Pause(PriceError::RateBudgetExhausted)) => {
                    budget_exhausted = true;
                    debug!(token = %token_key, "budget exhausted during advance");
                }
                Err(ProcessError::Pause(e)) => {
                    debug!(token = %token_key, error = %e, "advance failed, will retry next cycle");
                }
                Err(ProcessError::Store(e)) => {
                    return Err(e).context("tracking store failure during live cycle");
                }
            }
        }

        if budget_exhausted {
            RunStats::bump(&ctx.stats.pauses);
            let wait = (ctx.config.live_cycle_period / 2).min(Duration::from_secs(15 * 60));
            warn!(wait_secs = wait.as_secs(), "⏸️ rate budget exhausted; pausing before next cycle");
            sleep(wait).await;
        }

        ctx.price.cache().flush().context("flush price cache")?;
        ctx.refresh_reputation(Utc::now().timestamp())?;
        Ok(())
    }

    /// Admit one fresh mention from the extraction feed.
    async fn admit(&self, mention: &ExtractedMention) {
        let now = Utc::now().timestamp();
        match process_mention(&self.ctx, mention, now, Mode::Live).await {
            Ok(disposition) => {
                debug!(message = mention.message_id, ?disposition, "live mention processed");
            }
            Err(e) => {
                RunStats::bump(&self.ctx.stats.failures);
                warn!(message = mention.message_id, error = %e, "live mention failed");
            }
        }
    }
}

async fn recv_mention(
    rx: &mut Option<mpsc::Receiver<ExtractedMention>>,
) -> Option<ExtractedMention> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Advance one signal: capture newly reached checkpoints at the current
/// price; archive and learn on terminal. The per-token mutex spans the whole
/// active→completed transition.
async fn advance_signal(ctx: &AppContext, token_key: &str) -> Result<(), ProcessError> {
    let lock = ctx.token_lock(token_key);
    let _guard = lock.lock().await;

    // Re-read under the lock; another worker may have archived it.
    let Some(mut outcome) = ctx.store.get_active(token_key) else {
        return Ok(());
    };

    let now = Utc::now().timestamp();
    let pending: Vec<_> = ctx
        .price
        .calculate_smart_checkpoints(outcome.entry_time, now)
        .into_iter()
        .filter(|c| !outcome.checkpoints.contains_key(c))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    // Stored refs were admitted through the resolver already; re-resolution
    // only rebuilds provider identifiers, so the prefix gate is bypassed.
    let resolved = match ctx.price.resolver().resolve(&outcome.token_ref, true) {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(token = %token_key, error = %e, "stored token ref no longer resolves");
            return Ok(());
        }
    };

    match ctx.price.get_current(&resolved).await {
        Ok(reading) => {
            outcome.fetch_failures = 0;
            match ctx.lifecycle.advance_live(&mut outcome, now, Some(reading.price)) {
                Some(event) => {
                    ctx.commit_terminal(&outcome, &event, Mode::Live, now)?;
                    info!(
                        signal = %outcome.signal_id,
                        category = outcome
                            .outcome_category
                            .map(|c| c.as_str())
                            .unwrap_or("?"),
                        "🏁 signal completed"
                    );
                }
                None => ctx.store.update_active(&outcome)?,
            }
            Ok(())
        }
        Err(PriceError::RateBudgetExhausted) => {
            Err(ProcessError::Pause(PriceError::RateBudgetExhausted))
        }
        Err(e) => {
            outcome.fetch_failures += 1;
            if outcome.fetch_failures >= MAX_CONSECUTIVE_FAILURES {
                // Escalation: close as LOSER with provenance, never silently.
                let fetch_failures = outcome.fetch_failures;
                let event = ctx.lifecycle.force_close(
                    &mut outcome,
                    now,
                    format!(
                        "{} consecutive checkpoint failures ({})",
                        fetch_failures, e
                    ),
                );
                RunStats::bump(&ctx.stats.forced_closed);
                ctx.commit_terminal(&outcome, &event, Mode::Live, now)?;
            } else {
                debug!(
                    signal = %outcome.signal_id,
                    failures = outcome.fetch_failures,
                    error = %e,
                    "checkpoint fetch failed; leaving in progress"
                );
                ctx.store.update_active(&outcome)?;
            }
            Ok(())
        }
    }
}
