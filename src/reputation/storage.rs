//! Reputation persistence: `reputation/channels.json` and
//! `reputation/cross_channel.json`, versioned and atomically replaced like
//! every other durable file. Reputation holds only ids and token keys;
//! signals themselves stay in the tracking store.

use crate::persist::{atomic_write_json, load_json};
use crate::reputation::{ChannelReputation, CrossChannelTokenStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tracing::info;

pub const REPUTATION_STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ChannelsFile {
    version: u32,
    channels: HashMap<String, ChannelReputation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CrossChannelFile {
    version: u32,
    tokens: HashMap<String, CrossChannelTokenStats>,
}

pub struct ReputationStore {
    channels_path: PathBuf,
    cross_path: PathBuf,
    channels: Mutex<HashMap<String, ChannelReputation>>,
    cross: Mutex<HashMap<String, CrossChannelTokenStats>>,
}

impl ReputationStore {
    pub fn new(reputation_dir: PathBuf) -> Self {
        Self {
            channels_path: reputation_dir.join("channels.json"),
            cross_path: reputation_dir.join("cross_channel.json"),
            channels: Mutex::new(HashMap::new()),
            cross: Mutex::new(HashMap::new()),
        }
    }

    pub fn load(&self) -> io::Result<()> {
        if let Some(file) = load_json::<ChannelsFile>(&self.channels_path)? {
            if file.version != REPUTATION_STORE_VERSION {
                return Err(version_mismatch("channels", file.version));
            }
            *self.channels.lock() = file.channels;
        }
        if let Some(file) = load_json::<CrossChannelFile>(&self.cross_path)? {
            if file.version != REPUTATION_STORE_VERSION {
                return Err(version_mismatch("cross_channel", file.version));
            }
            *self.cross.lock() = file.tokens;
        }
        info!(
            channels = self.channels.lock().len(),
            tokens = self.cross.lock().len(),
            "reputation store loaded"
        );
        Ok(())
    }

    pub fn save(&self) -> io::Result<()> {
        let channels = ChannelsFile {
            version: REPUTATION_STORE_VERSION,
            channels: self.channels.lock().clone(),
        };
        atomic_write_json(&self.channels_path, &channels)?;

        let cross = CrossChannelFile {
            version: REPUTATION_STORE_VERSION,
            tokens: self.cross.lock().clone(),
        };
        atomic_write_json(&self.cross_path, &cross)
    }

    pub fn channel(&self, channel_id: &str) -> Option<ChannelReputation> {
        self.channels.lock().get(channel_id).cloned()
    }

    pub fn channels(&self) -> Vec<ChannelReputation> {
        self.channels.lock().values().cloned().collect()
    }

    pub fn cross_channel(&self, token_key: &str) -> Option<CrossChannelTokenStats> {
        self.cross.lock().get(token_key).cloned()
    }

    pub fn cross_channel_all(&self) -> Vec<CrossChannelTokenStats> {
        self.cross.lock().values().cloned().collect()
    }

    /// Mutate one channel's record under the store lock.
    pub fn with_channel<R>(
        &self,
        channel_id: &str,
        channel_name: &str,
        f: impl FnOnce(&mut ChannelReputation) -> R,
    ) -> R {
        let mut channels = self.channels.lock();
        let entry = channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelReputation {
                channel_id: channel_id.to_string(),
                channel_name: channel_name.to_string(),
                ..ChannelReputation::default()
            });
        if entry.channel_name.is_empty() && !channel_name.is_empty() {
            entry.channel_name = channel_name.to_string();
        }
        f(entry)
    }

    /// Drop all learned state. The bootstrap's final pass rebuilds both maps
    /// from the completed signals, so clearing first keeps the pass
    /// idempotent across resumed runs.
    pub fn clear(&self) {
        self.channels.lock().clear();
        self.cross.lock().clear();
    }

    pub fn with_cross_channel<R>(
        &self,
        token_key: &str,
        f: impl FnOnce(&mut CrossChannelTokenStats) -> R,
    ) -> R {
        let mut cross = self.cross.lock();
        let entry = cross
            .entry(token_key.to_string())
            .or_insert_with(|| CrossChannelTokenStats {
                token_key: token_key.to_string(),
                ..CrossChannelTokenStats::default()
            });
        f(entry)
    }
}

fn version_mismatch(which: &str, found: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "reputation {} version {} != expected {}",
            which, found, REPUTATION_STORE_VERSION
        ),
    )
}
