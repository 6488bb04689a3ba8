//! Startup recovery.
//!
//! 1. Load the snapshot, if any, into the engine.
//! 2. Read the WAL and replay every record newer than the snapshot's cutoff
//!    through the command dispatcher, at the time it was logged, exactly as
//!    live traffic ran.
//! 3. Reclaim keys whose deadline has passed since.
//! 4. Open the WAL for appending, continuing the sequence.
//!
//! Missing files mean an empty start. A corrupt file stops startup, with one
//! exception: a final WAL line with no terminating newline is the remains of
//! a write interrupted by a crash. It was never acknowledged, so it is
//! dropped and cut from the file.

use crate::commands::CommandHandler;
use crate::persistence::wal::{self, ReadError};
use crate::persistence::{RecoveryError, Snapshot};
use std::fs::OpenOptions;
use std::time::Instant;
use tracing::{info, warn};

/// What recovery found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Keys loaded from the snapshot, including ones that have since expired.
    pub snapshot_keys: usize,
    /// Sequence number the snapshot covers.
    pub snapshot_cutoff: u64,
    /// WAL records re-executed.
    pub replayed: usize,
    /// WAL records already covered by the snapshot.
    pub skipped: usize,
    /// Keys reclaimed after replay because their deadline had passed.
    pub expired: usize,
    /// Bytes of a torn final WAL line that were discarded.
    pub truncated_bytes: usize,
    /// Sequence number new mutations continue from.
    pub last_seq: u64,
}

/// Restores persisted state into `handler`'s engine and opens the WAL.
pub async fn recover(handler: &CommandHandler) -> Result<RecoveryReport, RecoveryError> {
    let started = Instant::now();
    let persistence = handler.persistence();
    let config = persistence.config();
    let mut report = RecoveryReport::default();

    let snapshot_path = config.snapshot_path();
    if let Some(snapshot) = Snapshot::load(&snapshot_path)? {
        report.snapshot_cutoff = snapshot.wal_cutoff;
        report.snapshot_keys = handler.storage().restore(snapshot.entries);
        info!(
            path = %snapshot_path.display(),
            keys = report.snapshot_keys,
            cutoff = report.snapshot_cutoff,
            "Snapshot loaded"
        );
    }
    report.last_seq = report.snapshot_cutoff;

    let wal_path = config.wal_path();
    if config.appendonly {
        let contents = wal::read_records(&wal_path).map_err(|e| match e {
            ReadError::Io(source) => RecoveryError::Io {
                path: wal_path.clone(),
                source,
            },
            ReadError::Corrupt { line, source } => RecoveryError::CorruptWal {
                path: wal_path.clone(),
                line,
                source,
            },
        })?;

        if contents.torn_bytes > 0 {
            warn!(
                path = %wal_path.display(),
                bytes = contents.torn_bytes,
                "Dropping incomplete final WAL record"
            );
            OpenOptions::new()
                .write(true)
                .open(&wal_path)
                .and_then(|file| file.set_len(contents.valid_len))
                .map_err(|source| RecoveryError::Io {
                    path: wal_path.clone(),
                    source,
                })?;
            report.truncated_bytes = contents.torn_bytes;
        }

        for record in contents.records {
            if record.seq <= report.snapshot_cutoff {
                report.skipped += 1;
                continue;
            }
            handler
                .replay(&record.args, record.timestamp_ms)
                .map_err(|e| RecoveryError::Replay {
                    seq: record.seq,
                    reason: e.to_string(),
                })?;
            report.replayed += 1;
            report.last_seq = report.last_seq.max(record.seq);
        }
    }

    report.expired = handler.storage().purge_expired(None).expired;

    persistence
        .open_log(report.last_seq)
        .await
        .map_err(|source| RecoveryError::Io {
            path: wal_path,
            source,
        })?;

    info!(
        keys = handler.storage().len(),
        replayed = report.replayed,
        skipped = report.skipped,
        expired = report.expired,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Recovery complete"
    );
    Ok(report)
}
