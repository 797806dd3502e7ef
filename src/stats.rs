//! Run statistics shared across orchestrator workers.
//!
//! Plain atomic counters: cheap to bump from any task, summarized on the
//! operator stream at cycle and run boundaries.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

#[derive(Debug, Default)]
pub struct RunStats {
    pub processed: AtomicU64,
    pub duplicates: AtomicU64,
    pub skipped_unresolvable: AtomicU64,
    pub skipped_price_unavailable: AtomicU64,
    pub skipped_dead_token: AtomicU64,
    pub admitted: AtomicU64,
    pub archived: AtomicU64,
    pub forced_closed: AtomicU64,
    pub pauses: AtomicU64,
    pub failures: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            skipped_unresolvable: self.skipped_unresolvable.load(Ordering::Relaxed),
            skipped_price_unavailable: self.skipped_price_unavailable.load(Ordering::Relaxed),
            skipped_dead_token: self.skipped_dead_token.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            forced_closed: self.forced_closed.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self, label: &str) {
        let s = self.snapshot();
        info!(
            label,
            processed = s.processed,
            admitted = s.admitted,
            archived = s.archived,
            duplicates = s.duplicates,
            skipped_unresolvable = s.skipped_unresolvable,
            skipped_price_unavailable = s.skipped_price_unavailable,
            skipped_dead_token = s.skipped_dead_token,
            forced_closed = s.forced_closed,
            pauses = s.pauses,
            failures = s.failures,
            "📊 run statistics"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatsSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub skipped_unresolvable: u64,
    pub skipped_price_unavailable: u64,
    pub skipped_dead_token: u64,
    pub admitted: u64,
    pub archived: u64,
    pub forced_closed: u64,
    pub pauses: u64,
    pub failures: u64,
}
