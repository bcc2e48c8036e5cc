// Copyright (c) 2024 The Botho Foundation

//! Durable listener state.
//!
//! The checkpoint tracks three things independently:
//!
//! - `last_scanned_block`: every block up to here has had its logs attempted
//! - processed transactions: relayed successfully, never submitted again
//! - pending dispatches: decoded events whose relay call failed, retried with
//!   backoff until they succeed, are parked, or are purged by an operator
//!
//! It is rewritten wholesale on every flush via write-to-temp-then-rename.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{BlockHeight, BridgeEvent, TxHash};

/// Checkpoint persistence errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checkpoint {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    /// Relayed ids below the pruning floor are gone, so a rescan there would
    /// relay them again.
    #[error("cannot rewind to block {requested}: processed ids were pruned up to block {earliest}")]
    RewindBelowPruned {
        requested: BlockHeight,
        earliest: BlockHeight,
    },
}

/// Backoff schedule for failed relay calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Park the dispatch after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Delay before the next attempt once `attempts` attempts have failed.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(900),
            max_attempts: None,
        }
    }
}

/// A decoded event whose relay call has not succeeded yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDispatch {
    pub event: BridgeEvent,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: String,
    /// Retries exhausted; only an operator requeue brings it back.
    #[serde(default)]
    pub parked: bool,
}

impl PendingDispatch {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.parked && self.next_attempt_at <= now
    }
}

/// On-disk layout. The first two keys are the whole legacy format.
#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    last_scanned_block: BlockHeight,

    #[serde(default)]
    processed_txs: Vec<TxHash>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    processed_heights: BTreeMap<TxHash, BlockHeight>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pending: Vec<PendingDispatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pruned_below: Option<BlockHeight>,
}

/// Scan progress plus relay bookkeeping. Owned by a single engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    last_scanned_block: BlockHeight,
    /// Relayed transactions and, when known, the block of their event.
    processed: HashMap<TxHash, Option<BlockHeight>>,
    pending: BTreeMap<TxHash, PendingDispatch>,
    /// Processed ids of events below this height may have been pruned.
    pruned_below: Option<BlockHeight>,
}

impl Checkpoint {
    /// Fresh state that will start scanning at `last_scanned_block + 1`.
    pub fn new(last_scanned_block: BlockHeight) -> Self {
        Self {
            last_scanned_block,
            ..Default::default()
        }
    }

    /// Load a checkpoint, or `None` if the file does not exist (cold start).
    pub fn load(path: &Path) -> Result<Option<Self>, CheckpointError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No checkpoint at {}, cold start", path.display());
                return Ok(None);
            }
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let file: CheckpointFile =
            serde_json::from_str(&content).map_err(|source| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        let checkpoint = Self::from(file);

        info!(
            "Loaded checkpoint: last_scanned_block={}, processed={}, pending={}",
            checkpoint.last_scanned_block,
            checkpoint.processed.len(),
            checkpoint.pending.len()
        );

        Ok(Some(checkpoint))
    }

    /// Save the checkpoint atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let content = serde_json::to_string_pretty(&CheckpointFile::from(self))
            .map_err(CheckpointError::Encode)?;
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let temp_path = temp_path(path);
        let mut temp = File::create(&temp_path).map_err(io_err)?;
        temp.write_all(content.as_bytes()).map_err(io_err)?;
        temp.sync_all().map_err(io_err)?;
        drop(temp);

        fs::rename(&temp_path, path).map_err(io_err)?;

        debug!(
            "Saved checkpoint: last_scanned_block={}",
            self.last_scanned_block
        );

        Ok(())
    }

    pub fn last_scanned_block(&self) -> BlockHeight {
        self.last_scanned_block
    }

    /// Mark every block up to `height` as scanned. Never moves backwards;
    /// returns whether progress was made.
    pub fn advance_to(&mut self, height: BlockHeight) -> bool {
        if height < self.last_scanned_block {
            warn!(
                "Refusing to move checkpoint back from {} to {}",
                self.last_scanned_block, height
            );
            return false;
        }
        let advanced = height > self.last_scanned_block;
        self.last_scanned_block = height;
        advanced
    }

    /// Operator rewind before the engine starts. Relayed ids are kept, so a
    /// re-scan never relays the same transaction twice. Refused when the
    /// re-scan would reach blocks whose ids were pruned.
    pub fn rewind_to(&mut self, height: BlockHeight) -> Result<(), CheckpointError> {
        let earliest = self.earliest_rewind();
        if height < earliest {
            return Err(CheckpointError::RewindBelowPruned {
                requested: height,
                earliest,
            });
        }

        info!(
            "Rewinding checkpoint from {} to {}",
            self.last_scanned_block, height
        );
        self.last_scanned_block = height;
        Ok(())
    }

    /// Lowest height `rewind_to` accepts.
    pub fn earliest_rewind(&self) -> BlockHeight {
        self.pruned_below.map_or(0, |floor| floor.saturating_sub(1))
    }

    pub fn is_processed(&self, tx: &TxHash) -> bool {
        self.processed.contains_key(tx)
    }

    pub fn is_pending(&self, tx: &TxHash) -> bool {
        self.pending.contains_key(tx)
    }

    /// Already relayed or waiting for a retry: the scan must not submit it.
    pub fn is_known(&self, tx: &TxHash) -> bool {
        self.is_processed(tx) || self.is_pending(tx)
    }

    /// Record a successful relay. Clears any pending entry for the same id.
    /// Returns `false` if the id was already processed.
    pub fn mark_processed(&mut self, tx: TxHash, height: Option<BlockHeight>) -> bool {
        self.pending.remove(&tx);
        if self.processed.contains_key(&tx) {
            return false;
        }
        self.processed.insert(tx, height);
        true
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    /// Record a failed relay attempt for `event`, scheduling the next one.
    pub fn record_failure(
        &mut self,
        event: &BridgeEvent,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> &PendingDispatch {
        let entry = self
            .pending
            .entry(event.transaction_hash)
            .or_insert_with(|| PendingDispatch {
                event: event.clone(),
                attempts: 0,
                next_attempt_at: now,
                last_error: String::new(),
                parked: false,
            });

        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = error.to_string();
        entry.next_attempt_at = now
            .checked_add_signed(
                TimeDelta::from_std(policy.delay_for(entry.attempts)).unwrap_or(TimeDelta::MAX),
            )
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        entry.parked = policy.is_exhausted(entry.attempts);

        entry
    }

    /// Events whose next attempt is due, oldest block first.
    pub fn due_dispatches(&self, now: DateTime<Utc>) -> Vec<BridgeEvent> {
        let mut due: Vec<BridgeEvent> = self
            .pending
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| p.event.clone())
            .collect();
        due.sort_by_key(|e| (e.block_height, e.transaction_hash));
        due
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingDispatch> {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn parked_count(&self) -> usize {
        self.pending.values().filter(|p| p.parked).count()
    }

    /// Make a pending or parked dispatch due now with a fresh attempt budget.
    pub fn requeue(&mut self, tx: &TxHash, now: DateTime<Utc>) -> bool {
        match self.pending.get_mut(tx) {
            Some(entry) => {
                entry.attempts = 0;
                entry.parked = false;
                entry.next_attempt_at = now;
                true
            }
            None => false,
        }
    }

    /// Drop a pending dispatch without relaying it. The id is recorded as
    /// processed so a later re-scan does not bring it back.
    pub fn purge(&mut self, tx: &TxHash) -> Option<PendingDispatch> {
        let removed = self.pending.remove(tx)?;
        self.processed.insert(*tx, Some(removed.event.block_height));
        Some(removed)
    }

    /// Forget processed ids whose event is more than `retention` blocks behind
    /// the scan position. Ids with an unknown height are kept.
    pub fn prune_processed(&mut self, retention: u64) -> usize {
        let Some(cutoff) = self.last_scanned_block.checked_sub(retention) else {
            return 0;
        };
        self.pruned_below = Some(self.pruned_below.map_or(cutoff, |floor| floor.max(cutoff)));
        let before = self.processed.len();
        self.processed
            .retain(|_, height| height.map_or(true, |h| h >= cutoff));
        before - self.processed.len()
    }

    /// Format a human-readable summary.
    pub fn summary(&self) -> String {
        let next_retry = self
            .pending
            .values()
            .filter(|p| !p.parked)
            .map(|p| p.next_attempt_at)
            .min()
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "none".to_string());

        format!(
            "Checkpoint:\n  Last scanned block: {}\n  Processed transactions: {}\n  Pending dispatches: {} ({} parked)\n  Next retry: {}",
            self.last_scanned_block,
            self.processed.len(),
            self.pending.len(),
            self.parked_count(),
            next_retry
        )
    }
}

/// `<file>.tmp` next to the target, whatever the target's extension.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl From<CheckpointFile> for Checkpoint {
    fn from(file: CheckpointFile) -> Self {
        let mut processed: HashMap<TxHash, Option<BlockHeight>> = file
            .processed_txs
            .into_iter()
            .map(|tx| (tx, None))
            .collect();
        for (tx, height) in file.processed_heights {
            processed.insert(tx, Some(height));
        }

        let pending = file
            .pending
            .into_iter()
            .filter(|p| !processed.contains_key(&p.event.transaction_hash))
            .map(|p| (p.event.transaction_hash, p))
            .collect();

        Self {
            last_scanned_block: file.last_scanned_block,
            processed,
            pending,
            pruned_below: file.pruned_below,
        }
    }
}

impl From<&Checkpoint> for CheckpointFile {
    fn from(checkpoint: &Checkpoint) -> Self {
        let mut processed_txs: Vec<TxHash> = checkpoint.processed.keys().copied().collect();
        processed_txs.sort();

        let processed_heights = checkpoint
            .processed
            .iter()
            .filter_map(|(tx, height)| height.map(|h| (*tx, h)))
            .collect();

        Self {
            last_scanned_block: checkpoint.last_scanned_block,
            processed_txs,
            processed_heights,
            pending: checkpoint.pending.values().cloned().collect(),
            pruned_below: checkpoint.pruned_below,
        }
    }
}
