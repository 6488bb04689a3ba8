//! Durability Module
//!
//! Keeps the in-memory key space recoverable across restarts.
//!
//! ## Architecture
//!
//! ```text
//!   mutating command
//!         │
//!         ▼
//! ┌─────────────────┐   apply    ┌───────────────┐
//! │   log lock      │──────────> │ StorageEngine │
//! │ (tokio Mutex)   │            └───────────────┘
//! │                 │   append   ┌───────────────┐
//! │   seq counter   │──────────> │     WAL       │  appendonly.aof
//! └─────────────────┘            └───────────────┘
//!         ▲                              ▲
//!         │ capture (dump + seq)         │ compact (seq <= cutoff)
//! ┌─────────────────┐   write    ┌───────────────┐
//! │  Snapshotter    │──────────> │   Snapshot    │  dump.json
//! └─────────────────┘            └───────────────┘
//! ```
//!
//! The log lock is held from the moment a mutation is applied until its WAL
//! record is flushed, so the order of records always equals the order in
//! which mutations reached the engine. Snapshots capture the key space and
//! the current sequence number under the same lock, giving a cut that lines
//! up exactly with the log.
//!
//! On startup [`recovery::recover`] loads the snapshot and replays every
//! record after its cutoff.

pub mod record;
pub mod recovery;
pub mod snapshot;
pub mod snapshotter;
pub mod wal;

pub use recovery::{recover, RecoveryReport};
pub use snapshot::Snapshot;
pub use snapshotter::Snapshotter;
pub use wal::{FsyncPolicy, UnknownFsyncPolicy, Wal};

use crate::persistence::record::RecordError;
use crate::storage::StorageEngine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Failures while persisting. The in-memory state is unaffected by them.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("WAL write failed: {0}")]
    Wal(#[source] io::Error),

    #[error("snapshot write failed: {0}")]
    Snapshot(#[source] io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("snapshot task failed: {0}")]
    Task(String),

    #[error("persistence is shut down")]
    Closed,
}

/// Failures while loading persisted state at startup.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt snapshot {} at line {line}: {reason}", path.display())]
    CorruptSnapshot {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("corrupt WAL {} at line {line}: {source}", path.display())]
    CorruptWal {
        path: PathBuf,
        line: usize,
        #[source]
        source: RecordError,
    },

    #[error("replaying WAL record {seq} failed: {reason}")]
    Replay { seq: u64, reason: String },
}

/// "Snapshot after `changes` writes within `seconds`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRule {
    pub seconds: u64,
    pub changes: u64,
}

impl SaveRule {
    pub const fn new(seconds: u64, changes: u64) -> Self {
        Self { seconds, changes }
    }

    /// `3600/1`, `300/100`, `60/10000`.
    pub fn defaults() -> Vec<SaveRule> {
        vec![
            SaveRule::new(3600, 1),
            SaveRule::new(300, 100),
            SaveRule::new(60, 10_000),
        ]
    }
}

/// File locations and policies for the durability subsystem.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub dir: PathBuf,
    pub appendonly: bool,
    pub appendfilename: String,
    pub fsync: FsyncPolicy,
    pub snapshot_enabled: bool,
    pub dbfilename: String,
    pub save_rules: Vec<SaveRule>,
    /// Snapshot at least this often while there are unsaved changes.
    pub snapshot_interval: Option<Duration>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            appendonly: true,
            appendfilename: "appendonly.aof".to_string(),
            fsync: FsyncPolicy::EverySec,
            snapshot_enabled: true,
            dbfilename: "dump.json".to_string(),
            save_rules: SaveRule::defaults(),
            snapshot_interval: None,
        }
    }
}

impl PersistenceConfig {
    /// Nothing is written to disk.
    pub fn disabled() -> Self {
        Self {
            appendonly: false,
            snapshot_enabled: false,
            save_rules: Vec::new(),
            ..Self::default()
        }
    }

    /// Defaults rooted at `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.dir.join(&self.appendfilename)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.dbfilename)
    }
}

/// Durability counters.
#[derive(Debug, Default)]
pub struct PersistenceStats {
    /// Records written to the WAL
    pub appended: AtomicU64,
    /// Records that could not be written
    pub failed_appends: AtomicU64,
    /// Snapshots written
    pub snapshots: AtomicU64,
    /// Snapshots that failed
    pub failed_snapshots: AtomicU64,
    /// Background fsyncs performed
    pub fsyncs: AtomicU64,
}

#[derive(Debug)]
struct LogState {
    wal: Option<Wal>,
    /// Sequence number of the last mutation applied.
    seq: u64,
    closed: bool,
}

/// Exclusive access to the log, held across apply + append.
pub struct LogGuard<'a> {
    state: MutexGuard<'a, LogState>,
    persistence: &'a Persistence,
}

impl LogGuard<'_> {
    /// Records a mutation that has just been applied at `timestamp_ms`.
    ///
    /// Returns the record's sequence number. The record is flushed to the OS
    /// (and synced under `always`) before this returns.
    pub fn append(&mut self, timestamp_ms: u64, args: &[Bytes]) -> Result<u64, PersistenceError> {
        if self.state.closed {
            return Err(PersistenceError::Closed);
        }

        self.state.seq += 1;
        let seq = self.state.seq;
        self.persistence.dirty.fetch_add(1, Ordering::Relaxed);

        let stats = &self.persistence.stats;
        if let Some(wal) = self.state.wal.as_mut() {
            if let Err(e) = wal.append(seq, timestamp_ms, args) {
                stats.failed_appends.fetch_add(1, Ordering::Relaxed);
                return Err(PersistenceError::Wal(e));
            }
            stats.appended.fetch_add(1, Ordering::Relaxed);
        }
        Ok(seq)
    }

    /// Sequence number of the last logged mutation.
    pub fn seq(&self) -> u64 {
        self.state.seq
    }
}

/// Shared durability state. Hand an `Arc` to the dispatcher and background tasks.
#[derive(Debug)]
pub struct Persistence {
    config: PersistenceConfig,
    log: Mutex<LogState>,
    /// One snapshot at a time.
    snapshot_gate: Mutex<()>,
    /// Mutations since the last successful snapshot.
    dirty: AtomicU64,
    last_snapshot: StdMutex<Instant>,
    stats: PersistenceStats,
}

impl Persistence {
    /// Creates the subsystem. No file is touched until [`open_log`](Self::open_log).
    pub fn new(config: PersistenceConfig) -> Self {
        Self {
            config,
            log: Mutex::new(LogState {
                wal: None,
                seq: 0,
                closed: false,
            }),
            snapshot_gate: Mutex::new(()),
            dirty: AtomicU64::new(0),
            last_snapshot: StdMutex::new(Instant::now()),
            stats: PersistenceStats::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(PersistenceConfig::disabled())
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn stats(&self) -> &PersistenceStats {
        &self.stats
    }

    /// Mutations not yet covered by a snapshot.
    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Opens the WAL for appending, continuing after `last_seq`.
    ///
    /// Called once recovery has replayed the existing log.
    pub async fn open_log(&self, last_seq: u64) -> io::Result<()> {
        let mut state = self.log.lock().await;
        state.seq = last_seq;
        if self.config.appendonly {
            if let Some(parent) = self.config.wal_path().parent() {
                std::fs::create_dir_all(parent)?;
            }
            let wal = Wal::open(self.config.wal_path(), self.config.fsync)?;
            info!(
                path = %wal.path().display(),
                fsync = %self.config.fsync,
                next_seq = last_seq + 1,
                "WAL opened"
            );
            state.wal = Some(wal);
        }
        Ok(())
    }

    /// Takes the log lock. Apply the mutation and append it while holding it.
    pub async fn begin(&self) -> LogGuard<'_> {
        LogGuard {
            state: self.log.lock().await,
            persistence: self,
        }
    }

    /// Forces buffered WAL records to disk.
    pub async fn sync_wal(&self) -> Result<(), PersistenceError> {
        let mut state = self.log.lock().await;
        if let Some(wal) = state.wal.as_mut() {
            wal.sync().map_err(PersistenceError::Wal)?;
            self.stats.fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Whether a save rule or the fixed interval calls for a snapshot now.
    pub fn snapshot_due(&self) -> bool {
        if !self.config.snapshot_enabled {
            return false;
        }
        let dirty = self.dirty();
        if dirty == 0 {
            return false;
        }

        let elapsed = self
            .last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();

        let rule_fired = self
            .config
            .save_rules
            .iter()
            .any(|rule| dirty >= rule.changes && elapsed >= Duration::from_secs(rule.seconds));
        let interval_fired = self
            .config
            .snapshot_interval
            .is_some_and(|interval| elapsed >= interval);

        rule_fired || interval_fired
    }

    /// Writes a snapshot of `storage` and compacts the WAL behind it.
    ///
    /// Returns the WAL cutoff the snapshot covers.
    pub async fn snapshot(&self, storage: &StorageEngine) -> Result<u64, PersistenceError> {
        let _gate = self.snapshot_gate.lock().await;
        let started = Instant::now();

        let (snapshot, dirty_at_capture) = {
            let state = self.log.lock().await;
            if state.closed {
                return Err(PersistenceError::Closed);
            }
            (Snapshot::new(storage.dump(), state.seq), self.dirty())
        };
        let cutoff = snapshot.wal_cutoff;
        let entries = snapshot.entries.len();

        let path = self.config.snapshot_path();
        let written = tokio::task::spawn_blocking(move || snapshot.write_to(&path))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))
            .and_then(|result| result);
        if let Err(e) = written {
            self.stats.failed_snapshots.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Snapshot failed");
            return Err(e);
        }

        self.dirty.fetch_sub(dirty_at_capture, Ordering::Relaxed);
        *self
            .last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.stats.snapshots.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.log.lock().await;
            if let Some(wal) = state.wal.as_mut() {
                wal.compact(cutoff).map_err(PersistenceError::Wal)?;
            }
        }

        debug!(
            entries,
            cutoff,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot written"
        );
        Ok(cutoff)
    }

    /// Flushes the WAL, writes a final snapshot, and closes the log.
    ///
    /// Mutations attempted afterwards are reported as [`PersistenceError::Closed`].
    pub async fn shutdown(&self, storage: &StorageEngine) -> Result<(), PersistenceError> {
        self.sync_wal().await?;

        if self.config.snapshot_enabled {
            self.snapshot(storage).await?;
        }

        let mut state = self.log.lock().await;
        if let Some(mut wal) = state.wal.take() {
            wal.sync().map_err(PersistenceError::Wal)?;
        }
        state.closed = true;
        info!(last_seq = state.seq, "Persistence shut down");
        Ok(())
    }
}
