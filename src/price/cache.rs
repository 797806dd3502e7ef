//! Persistent price-point cache.
//!
//! Daily-bucketed historical points are authoritative and never expire;
//! current prices get a short in-memory TTL. The cache hit path touches
//! neither the network nor any rate limiter. Writes append in memory and the
//! whole file is atomically rewritten at checkpoint boundaries (`flush`).

use crate::models::{day_bucket, PriceReading};
use crate::persist::{atomic_write_json, load_json};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const PRICE_CACHE_VERSION: u32 = 1;
pub const CURRENT_PRICE_TTL: Duration = Duration::from_secs(5 * 60);

/// One immutable cached observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub token_key: String,
    pub timestamp_bucket: i64,
    pub price: f64,
    pub source_provider: String,
    pub fetched_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    /// Keyed `"{token_key}@{timestamp_bucket}"`.
    points: HashMap<String, PricePoint>,
}

fn point_key(token_key: &str, bucket: i64) -> String {
    format!("{}@{}", token_key, bucket)
}

pub struct PriceCache {
    path: PathBuf,
    points: RwLock<HashMap<String, PricePoint>>,
    dirty: AtomicBool,
    current: Mutex<HashMap<String, (Instant, PriceReading)>>,
}

impl PriceCache {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join("points.json"),
            points: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            current: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted points. A version mismatch is fatal (explicit
    /// migration required), matching every other durable file.
    pub fn load(&self) -> io::Result<()> {
        let Some(file) = load_json::<CacheFile>(&self.path)? else {
            info!(path = %self.path.display(), "no price cache on disk, starting empty");
            return Ok(());
        };
        if file.version != PRICE_CACHE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "price cache version {} != expected {}",
                    file.version, PRICE_CACHE_VERSION
                ),
            ));
        }
        let count = file.points.len();
        *self.points.write() = file.points;
        info!(points = count, "price cache loaded");
        Ok(())
    }

    /// Exact-key historical lookup.
    pub fn get(&self, token_key: &str, ts: i64) -> Option<f64> {
        let bucket = day_bucket(ts);
        let hit = self
            .points
            .read()
            .get(&point_key(token_key, bucket))
            .map(|p| p.price);
        if hit.is_some() {
            metrics::counter!("price_cache_hits", 1);
        }
        hit
    }

    /// Insert one historical observation. First write wins: cached points
    /// are immutable, a recurring fetch never rewrites history.
    pub fn insert(&self, token_key: &str, ts: i64, price: f64, source: &str, fetched_at: i64) {
        let bucket = day_bucket(ts);
        let key = point_key(token_key, bucket);
        let mut points = self.points.write();
        if points.contains_key(&key) {
            return;
        }
        points.insert(
            key,
            PricePoint {
                token_key: token_key.to_string(),
                timestamp_bucket: bucket,
                price,
                source_provider: source.to_string(),
                fetched_at,
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Current-price TTL cache (memory only).
    pub fn get_current(&self, token_key: &str) -> Option<PriceReading> {
        let cache = self.current.lock();
        let (at, reading) = cache.get(token_key)?;
        if at.elapsed() <= CURRENT_PRICE_TTL {
            Some(reading.clone())
        } else {
            None
        }
    }

    pub fn put_current(&self, token_key: &str, reading: PriceReading) {
        self.current
            .lock()
            .insert(token_key.to_string(), (Instant::now(), reading));
    }

    /// Rewrite the cache file if anything was appended since the last flush.
    pub fn flush(&self) -> io::Result<()> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot = self.points.read().clone();
        let file = CacheFile {
            version: PRICE_CACHE_VERSION,
            points: snapshot,
        };
        if let Err(e) = atomic_write_json(&self.path, &file) {
            // Leave dirty so the next flush retries.
            self.dirty.store(true, Ordering::Relaxed);
            warn!(error = %e, "price cache flush failed");
            return Err(e);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }
}
