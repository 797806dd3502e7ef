//! Bootstrap orchestrator: drives historical mentions through the pipeline
//! in chronological order, with checkpointed progress every 100 messages and
//! resume across restarts. Learning is seeded in one chronological pass over
//! all terminal outcomes after the last message.

use crate::app::{process_mention, AppContext, Disposition, Mode, ProcessError};
use crate::models::{BootstrapProgress, ExtractedMention, SignalOutcome, TerminalEvent};
use crate::persist::{atomic_write_json, load_json};
use crate::stats::RunStats;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

pub const BOOTSTRAP_PROGRESS_VERSION: u32 = 1;
const PROGRESS_EVERY: u64 = 100;
const PAUSE_BASE: Duration = Duration::from_secs(60);

pub struct BootstrapOrchestrator {
    ctx: Arc<AppContext>,
}

impl BootstrapOrchestrator {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, mentions: Vec<ExtractedMention>) -> Result<()> {
        let ctx = &self.ctx;
        let progress_path = ctx.config.bootstrap_progress_path();

        let resume = load_json::<BootstrapProgress>(&progress_path)
            .context("read bootstrap progress")?;
        if let Some(p) = &resume {
            if p.version != BOOTSTRAP_PROGRESS_VERSION {
                bail!(
                    "bootstrap progress version {} != expected {}",
                    p.version,
                    BOOTSTRAP_PROGRESS_VERSION
                );
            }
            info!(
                processed = p.processed_messages,
                last_message = p.last_processed_message_id,
                "▶️ resuming bootstrap"
            );
        }

        let total = mentions.len() as u64;
        let mut progress = resume.unwrap_or(BootstrapProgress {
            version: BOOTSTRAP_PROGRESS_VERSION,
            total_messages: total,
            processed_messages: 0,
            last_processed_message_id: i64::MIN,
            last_checkpoint_time: 0,
            successful_outcomes: 0,
            failed_outcomes: 0,
        });
        progress.total_messages = total;

        for mention in &mentions {
            if ctx.shutting_down() {
                info!("🛑 shutdown requested; checkpointing bootstrap");
                self.write_progress(&progress)?;
                ctx.persist_all(Utc::now().timestamp())?;
                return Ok(());
            }
            if mention.message_id <= progress.last_processed_message_id {
                continue;
            }

            self.process_with_pause(mention, &mut progress).await?;

            progress.processed_messages += 1;
            progress.last_processed_message_id = mention.message_id;

            if progress.processed_messages % PROGRESS_EVERY == 0 {
                progress.last_checkpoint_time = Utc::now().timestamp();
                self.write_progress(&progress)?;
                // Checkpoint boundary: the price cache rewrites here too.
                ctx.price.cache().flush().context("flush price cache")?;
                info!(
                    processed = progress.processed_messages,
                    total = progress.total_messages,
                    "bootstrap checkpoint"
                );
            }
        }

        let now = Utc::now().timestamp();
        self.seed_learning(now)?;
        ctx.persist_all(now)?;

        match std::fs::remove_file(&progress_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not remove bootstrap progress file"),
        }

        ctx.stats.log_summary("bootstrap");
        info!(
            successful = progress.successful_outcomes,
            failed = progress.failed_outcomes,
            "✅ bootstrap complete"
        );
        Ok(())
    }

    /// One mention, with the pause-and-resume-once policy for upstream
    /// exhaustion: back off (bounded by half the live cycle), retry once,
    /// then record the failure and move on.
    async fn process_with_pause(
        &self,
        mention: &ExtractedMention,
        progress: &mut BootstrapProgress,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let mut paused = false;

        loop {
            let now = Utc::now().timestamp();
            match process_mention(ctx, mention, now, Mode::Backfill).await {
                Ok(disposition) => {
                    match disposition {
                        Disposition::AdmittedInProgress | Disposition::AdmittedTerminal => {
                            progress.successful_outcomes += 1;
                        }
                        Disposition::Duplicate => {}
                        _ => progress.failed_outcomes += 1,
                    }
                    return Ok(());
                }
                Err(ProcessError::Pause(e)) if !paused => {
                    paused = true;
                    RunStats::bump(&ctx.stats.pauses);
                    let wait = PAUSE_BASE.min(ctx.config.live_cycle_period / 2);
                    warn!(
                        message = mention.message_id,
                        error = %e,
                        wait_secs = wait.as_secs(),
                        "⏸️ batch paused"
                    );
                    sleep(wait).await;
                }
                Err(ProcessError::Pause(e)) => {
                    warn!(
                        message = mention.message_id,
                        error = %e,
                        "batch still failing after pause; recording failure"
                    );
                    RunStats::bump(&ctx.stats.failures);
                    progress.failed_outcomes += 1;
                    return Ok(());
                }
                Err(ProcessError::Store(e)) => {
                    // Fatal: persist progress so the run can resume.
                    self.write_progress(progress)?;
                    return Err(e).context("tracking store failure during bootstrap");
                }
            }
        }
    }

    /// One pass of the learning engine over all terminal outcomes in
    /// chronological order, after the last message.
    fn seed_learning(&self, now: i64) -> Result<()> {
        let ctx = &self.ctx;
        // Rebuild from scratch so a resumed bootstrap never double-counts.
        ctx.learning.store().clear();
        let snapshot = ctx.store.snapshot();
        let mut terminals: Vec<&SignalOutcome> = snapshot
            .completed_signals()
            .filter(|s| s.is_terminal())
            .collect();
        terminals.sort_by_key(|s| (s.entry_time, s.signal_id.clone()));

        let mut applied = 0u64;
        for outcome in terminals {
            let Some(event) = TerminalEvent::from_outcome(outcome) else {
                continue;
            };
            match ctx
                .learning
                .apply_terminal(&event, &outcome.channel_name, now)
            {
                Ok(()) => applied += 1,
                Err(e) => warn!(signal = %outcome.signal_id, error = %e, "learning update reverted"),
            }
        }

        info!(outcomes = applied, "learning seeded from terminal outcomes");
        Ok(())
    }

    fn write_progress(&self, progress: &BootstrapProgress) -> Result<()> {
        atomic_write_json(&self.ctx.config.bootstrap_progress_path(), progress)
            .context("write bootstrap progress")
    }
}
