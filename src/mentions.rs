//! Inbound mention feed.
//!
//! The extraction layer (out of scope) delivers `ExtractedMention` tuples.
//! For backfill they arrive as a JSONL file, one tuple per line; malformed
//! lines are counted and skipped rather than failing the batch.

use crate::models::ExtractedMention;
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;

/// Read a JSONL mentions file, chronologically sorted for the bootstrap.
pub fn read_mentions_file(path: &Path) -> Result<Vec<ExtractedMention>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open mentions file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut mentions = Vec::new();
    let mut malformed = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of {}", line_no + 1, path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<ExtractedMention>(trimmed) {
            Ok(mention) => mentions.push(mention),
            Err(e) => {
                malformed += 1;
                warn!(line = line_no + 1, error = %e, "skipping malformed mention line");
            }
        }
    }

    if malformed > 0 {
        warn!(malformed, total = mentions.len(), "mentions file had malformed lines");
    }

    mentions.sort_by_key(|m| (m.entry_ts(), m.message_id));
    Ok(mentions)
}
