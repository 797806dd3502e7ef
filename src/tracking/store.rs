//! Two-file tracking store.
//!
//! `active_tracking.json` holds at most one in-progress signal per token;
//! `completed_history.json` holds every finished signal, ordered by signal
//! number. Every mutation persists through an atomic tempfile-then-rename
//! replace, and an archive keeps the pair consistent with an in-memory
//! backup plus a `.bak` sidecar so a crash between the two writes can be
//! rolled back on the next load.

use crate::models::{SignalOutcome, SignalStatus};
use crate::persist::{atomic_write_json, load_json};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TRACKING_STORE_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    InvariantViolation(String),
    IOFailure(String),
    VersionMismatch { found: u32, expected: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvariantViolation(msg) => write!(f, "store invariant violated: {}", msg),
            Self::IOFailure(msg) => write!(f, "store I/O failure: {}", msg),
            Self::VersionMismatch { found, expected } => {
                write!(f, "store version {} != expected {}", found, expected)
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Serialize, Deserialize)]
struct ActiveFile {
    version: u32,
    signals: HashMap<String, SignalOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompletedFile {
    version: u32,
    signals: HashMap<String, Vec<SignalOutcome>>,
}

/// Answer to "has this token already been called here?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionClass {
    pub is_duplicate: bool,
    pub next_signal_number: u32,
    pub previous_signal_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    active: HashMap<String, SignalOutcome>,
    completed: HashMap<String, Vec<SignalOutcome>>,
}

/// Read-only snapshot for exporters and the reputation engine.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub active: HashMap<String, SignalOutcome>,
    pub completed: HashMap<String, Vec<SignalOutcome>>,
}

impl StoreSnapshot {
    pub fn completed_signals(&self) -> impl Iterator<Item = &SignalOutcome> {
        self.completed.values().flatten()
    }
}

#[derive(Debug)]
pub struct TrackingStore {
    active_path: PathBuf,
    completed_path: PathBuf,
    backup_path: PathBuf,
    state: Mutex<StoreState>,
}

impl TrackingStore {
    pub fn new(active_path: PathBuf, completed_path: PathBuf) -> Self {
        let backup_path = {
            let mut name = active_path
                .file_name()
                .unwrap_or_default()
                .to_os_string();
            name.push(".bak");
            active_path.with_file_name(name)
        };
        Self {
            active_path,
            completed_path,
            backup_path,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn open(active_path: PathBuf, completed_path: PathBuf) -> Result<Self, StoreError> {
        let store = Self::new(active_path, completed_path);
        store.load()?;
        Ok(store)
    }

    /// Load both files, recover from a mid-archive crash if the rollback
    /// sidecar is present, then enforce the load-time invariants.
    pub fn load(&self) -> Result<(), StoreError> {
        self.recover_from_backup()?;

        let active = match load_json::<ActiveFile>(&self.active_path)
            .map_err(|e| StoreError::IOFailure(e.to_string()))?
        {
            Some(file) if file.version != TRACKING_STORE_VERSION => {
                return Err(StoreError::VersionMismatch {
                    found: file.version,
                    expected: TRACKING_STORE_VERSION,
                })
            }
            Some(file) => file.signals,
            None => HashMap::new(),
        };

        let completed = match load_json::<CompletedFile>(&self.completed_path)
            .map_err(|e| StoreError::IOFailure(e.to_string()))?
        {
            Some(file) if file.version != TRACKING_STORE_VERSION => {
                return Err(StoreError::VersionMismatch {
                    found: file.version,
                    expected: TRACKING_STORE_VERSION,
                })
            }
            Some(file) => file.signals,
            None => HashMap::new(),
        };

        let mut state = StoreState { active, completed };
        Self::enforce_invariants(&mut state)?;

        info!(
            active = state.active.len(),
            completed = state.completed.values().map(Vec::len).sum::<usize>(),
            "tracking store loaded"
        );
        *self.state.lock() = state;
        Ok(())
    }

    /// A `.bak` sidecar means a previous archive died between its two
    /// writes. Either the completed file already carries the moved signal
    /// (finish: drop the sidecar) or it does not (roll the active file back
    /// to the pre-archive state).
    fn recover_from_backup(&self) -> Result<(), StoreError> {
        let Some(backup) = load_json::<ActiveFile>(&self.backup_path)
            .map_err(|e| StoreError::IOFailure(e.to_string()))?
        else {
            return Ok(());
        };

        warn!("archive rollback sidecar found; recovering");

        let completed_ids: HashSet<String> = load_json::<CompletedFile>(&self.completed_path)
            .map_err(|e| StoreError::IOFailure(e.to_string()))?
            .map(|f| {
                f.signals
                    .values()
                    .flatten()
                    .map(|s| s.signal_id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let active_ids: HashSet<String> = load_json::<ActiveFile>(&self.active_path)
            .map_err(|e| StoreError::IOFailure(e.to_string()))?
            .map(|f| f.signals.values().map(|s| s.signal_id.clone()).collect())
            .unwrap_or_default();

        let orphaned: Vec<&str> = backup
            .signals
            .values()
            .map(|s| s.signal_id.as_str())
            .filter(|id| !completed_ids.contains(*id) && !active_ids.contains(*id))
            .collect();

        if orphaned.is_empty() {
            // The archive actually finished; only the sidecar cleanup was
            // lost. Post-archive state stands.
            info!("interrupted archive had completed; dropping sidecar");
        } else {
            warn!(
                orphaned = orphaned.len(),
                "interrupted archive lost signals; rolling active file back"
            );
            atomic_write_json(&self.active_path, &backup)
                .map_err(|e| StoreError::IOFailure(e.to_string()))?;
        }

        fs::remove_file(&self.backup_path).map_err(|e| StoreError::IOFailure(e.to_string()))?;
        Ok(())
    }

    fn enforce_invariants(state: &mut StoreState) -> Result<(), StoreError> {
        // No signal id may live in both files. Repair: the completed copy
        // wins (an archive is further along than an active write).
        let completed_ids: HashSet<String> = state
            .completed
            .values()
            .flatten()
            .map(|s| s.signal_id.clone())
            .collect();
        let shared: Vec<String> = state
            .active
            .iter()
            .filter(|(_, s)| completed_ids.contains(&s.signal_id))
            .map(|(k, _)| k.clone())
            .collect();
        for token_key in shared {
            warn!(
                token = %token_key,
                "signal present in both files; keeping completed copy"
            );
            state.active.remove(&token_key);
        }

        // Active signals must actually be in progress. A completed signal
        // stranded in the active file (crash between add and archive) is
        // repaired by finishing the move.
        let stranded: Vec<String> = state
            .active
            .iter()
            .filter(|(_, s)| s.status != SignalStatus::InProgress)
            .map(|(k, _)| k.clone())
            .collect();
        for token_key in stranded {
            if let Some(signal) = state.active.remove(&token_key) {
                warn!(
                    token = %token_key,
                    signal = %signal.signal_id,
                    "completed signal found in active file; archiving it"
                );
                state.completed.entry(token_key).or_default().push(signal);
            }
        }

        // Completed lists stay ordered; gaps are reported, never renumbered.
        for (token_key, signals) in state.completed.iter_mut() {
            signals.sort_by_key(|s| s.signal_number);
            for (i, signal) in signals.iter().enumerate() {
                let expected = (i + 1) as u32;
                if signal.signal_number != expected {
                    warn!(
                        token = %token_key,
                        found = signal.signal_number,
                        expected,
                        "non-contiguous signal numbering"
                    );
                }
            }
        }

        Ok(())
    }

    /// Dedup gate for a fresh mention.
    pub fn classify_mention(&self, token_key: &str) -> MentionClass {
        let state = self.state.lock();
        if state.active.contains_key(token_key) {
            return MentionClass {
                is_duplicate: true,
                next_signal_number: 0,
                previous_signal_ids: Vec::new(),
            };
        }
        let previous = state.completed.get(token_key);
        MentionClass {
            is_duplicate: false,
            next_signal_number: previous.map(|v| v.len() as u32).unwrap_or(0) + 1,
            previous_signal_ids: previous
                .map(|v| v.iter().map(|s| s.signal_id.clone()).collect())
                .unwrap_or_default(),
        }
    }

    pub fn add_active(&self, outcome: SignalOutcome) -> Result<(), StoreError> {
        let token_key = outcome.token_key();
        let mut state = self.state.lock();
        if state.active.contains_key(&token_key) {
            return Err(StoreError::InvariantViolation(format!(
                "token {} already has an active signal",
                token_key
            )));
        }
        state.active.insert(token_key.clone(), outcome);
        let result = self.save_active(&state);
        if result.is_err() {
            state.active.remove(&token_key);
        }
        result
    }

    pub fn update_active(&self, outcome: &SignalOutcome) -> Result<(), StoreError> {
        let token_key = outcome.token_key();
        let mut state = self.state.lock();
        match state.active.get(&token_key) {
            Some(existing) if existing.signal_id == outcome.signal_id => {}
            Some(existing) => {
                return Err(StoreError::InvariantViolation(format!(
                    "active signal for {} is {}, not {}",
                    token_key, existing.signal_id, outcome.signal_id
                )))
            }
            None => {
                return Err(StoreError::InvariantViolation(format!(
                    "no active signal for {}",
                    token_key
                )))
            }
        }
        let previous = state.active.insert(token_key.clone(), outcome.clone());
        let result = self.save_active(&state);
        if result.is_err() {
            if let Some(previous) = previous {
                state.active.insert(token_key, previous);
            }
        }
        result
    }

    /// Move the active signal for `token_key` to the end of its completed
    /// list, writing both files atomically with rollback.
    pub fn archive(&self, token_key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        let signal = state.active.get(token_key).cloned().ok_or_else(|| {
            StoreError::InvariantViolation(format!("no active signal for {}", token_key))
        })?;

        // Pre-archive backup: in memory for rollback, on disk for crash
        // recovery at next load.
        let backup = ActiveFile {
            version: TRACKING_STORE_VERSION,
            signals: state.active.clone(),
        };
        write_with_retry(&self.backup_path, &backup)?;

        state.active.remove(token_key);
        state
            .completed
            .entry(token_key.to_string())
            .or_default()
            .push(signal.clone());

        if let Err(e) = self.save_active(&state) {
            // First write failed: nothing on disk changed, undo memory.
            undo_archive(&mut state, token_key);
            let _ = fs::remove_file(&self.backup_path);
            return Err(e);
        }

        if let Err(e) = self.save_completed(&state) {
            // Second write failed: roll the active file back from the
            // in-memory backup so no signal is lost.
            undo_archive(&mut state, token_key);
            write_with_retry(&self.active_path, &backup)?;
            let _ = fs::remove_file(&self.backup_path);
            return Err(e);
        }

        if let Err(e) = fs::remove_file(&self.backup_path) {
            warn!(error = %e, "could not remove archive sidecar");
        }

        metrics::counter!("signals_archived", 1);
        debug!(token = %token_key, signal = %signal.signal_id, "signal archived");
        Ok(())
    }

    pub fn get_active(&self, token_key: &str) -> Option<SignalOutcome> {
        self.state.lock().active.get(token_key).cloned()
    }

    pub fn active_signals(&self) -> Vec<SignalOutcome> {
        self.state.lock().active.values().cloned().collect()
    }

    pub fn completed_for(&self, token_key: &str) -> Vec<SignalOutcome> {
        self.state
            .lock()
            .completed
            .get(token_key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            active: state.active.clone(),
            completed: state.completed.clone(),
        }
    }

    fn save_active(&self, state: &StoreState) -> Result<(), StoreError> {
        let file = ActiveFile {
            version: TRACKING_STORE_VERSION,
            signals: state.active.clone(),
        };
        write_with_retry(&self.active_path, &file)
    }

    fn save_completed(&self, state: &StoreState) -> Result<(), StoreError> {
        let file = CompletedFile {
            version: TRACKING_STORE_VERSION,
            signals: state.completed.clone(),
        };
        write_with_retry(&self.completed_path, &file)
    }
}

fn undo_archive(state: &mut StoreState, token_key: &str) {
    if let Some(list) = state.completed.get_mut(token_key) {
        if let Some(signal) = list.pop() {
            state.active.insert(token_key.to_string(), signal);
        }
        if list.is_empty() {
            state.completed.remove(token_key);
        }
    }
}

/// One retry on I/O failure, then give up (the caller treats the error as
/// fatal for the current operation).
fn write_with_retry<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    match atomic_write_json(path, value) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(path = %path.display(), error = %first, "store write failed, retrying once");
            atomic_write_json(path, value).map_err(|e| StoreError::IOFailure(e.to_string()))
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
