//! Background snapshot and fsync task.
//!
//! Wakes once per tick to:
//! - sync the WAL when the policy is `everysec`;
//! - write a snapshot when a save rule or the fixed interval says so.
//!
//! Failures are logged and retried on a later tick; they never stop the task.

use crate::persistence::{FsyncPolicy, Persistence};
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often rules are checked and `everysec` syncs happen.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// A handle to the running snapshotter. Dropping it stops the task.
#[derive(Debug)]
pub struct Snapshotter {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Snapshotter {
    /// Starts the task. Must be called from within a Tokio runtime.
    pub fn start(persistence: Arc<Persistence>, storage: Arc<StorageEngine>) -> Self {
        Self::with_tick(persistence, storage, DEFAULT_TICK)
    }

    pub fn with_tick(
        persistence: Arc<Persistence>,
        storage: Arc<StorageEngine>,
        tick: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            snapshots = persistence.config().snapshot_enabled,
            fsync = %persistence.config().fsync,
            "Background snapshotter started"
        );
        let task = tokio::spawn(snapshot_loop(persistence, storage, tick, shutdown_rx));
        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the task and waits for any in-flight snapshot to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Background snapshotter stopped");
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn snapshot_loop(
    persistence: Arc<Persistence>,
    storage: Arc<StorageEngine>,
    tick: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Snapshotter received shutdown signal");
                    return;
                }
            }
        }

        if persistence.config().fsync == FsyncPolicy::EverySec {
            if let Err(e) = persistence.sync_wal().await {
                warn!(error = %e, "Background WAL fsync failed");
            }
        }

        if persistence.snapshot_due() {
            match persistence.snapshot(&storage).await {
                Ok(cutoff) => debug!(cutoff, "Scheduled snapshot complete"),
                Err(e) => warn!(error = %e, "Scheduled snapshot failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{PersistenceConfig, SaveRule, Snapshot};
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_rule_triggers_snapshot() {
        let dir = tempdir().unwrap();
        let persistence = Arc::new(Persistence::new(PersistenceConfig {
            save_rules: vec![SaveRule::new(0, 1)],
            ..PersistenceConfig::in_dir(dir.path())
        }));
        persistence.open_log(0).await.unwrap();
        let storage = Arc::new(StorageEngine::new());

        {
            let mut log = persistence.begin().await;
            storage.set(Bytes::from("k"), Bytes::from("v"));
            log.append(
                1_000,
                &[Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")],
            )
            .unwrap();
        }

        let snapshotter = Snapshotter::with_tick(
            Arc::clone(&persistence),
            Arc::clone(&storage),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        snapshotter.shutdown().await;

        let snapshot = Snapshot::load(&persistence.config().snapshot_path())
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(persistence.dirty(), 0);
        assert!(persistence.stats().fsyncs.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_nothing_written_without_changes() {
        let dir = tempdir().unwrap();
        let persistence = Arc::new(Persistence::new(PersistenceConfig {
            save_rules: vec![SaveRule::new(0, 1)],
            ..PersistenceConfig::in_dir(dir.path())
        }));
        persistence.open_log(0).await.unwrap();

        let snapshotter = Snapshotter::with_tick(
            Arc::clone(&persistence),
            Arc::new(StorageEngine::new()),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        snapshotter.shutdown().await;

        assert!(!persistence.config().snapshot_path().exists());
    }
}
