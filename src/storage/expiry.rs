//! Background Expiry Sweeper
//!
//! Lazy expiry only reclaims keys that are touched again. A key that expires
//! and is never read would otherwise stay in memory forever, so a Tokio task
//! periodically purges expired keys as well ("active expiry").
//!
//! ## Passes
//!
//! Each wake-up runs one pass:
//! - without a sample size, the whole expiry index is scanned once;
//! - with `sample_size = N`, at most N index entries are examined per round,
//!   and rounds repeat while more than a quarter of the sample was expired.
//!
//! ## Adaptive Frequency
//!
//! If many keys are expiring, the sweeper runs more often (down to
//! `min_interval`). If nothing expires it backs off (up to `max_interval`).

use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Rounds per pass when sampling, so one pass cannot monopolise the lock.
const MAX_SAMPLE_ROUNDS: usize = 16;

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Interval the sweeper starts with (default: 1s)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 100ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// Expiry-index entries examined per round. `None` scans everything.
    pub sample_size: Option<usize>,

    /// If this fraction of scanned keys are expired, speed up sweeping
    pub speedup_threshold: f64,

    /// If this fraction of scanned keys are expired, slow down sweeping
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            sample_size: None,
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ExpirySweeper {
    /// Starts the expiry sweeper as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(engine: Arc<StorageEngine>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = config.base_interval.as_millis() as u64,
            sample_size = ?config.sample_size,
            "Background expiry sweeper started"
        );
        let task = tokio::spawn(sweeper_loop(engine, config, shutdown_rx));

        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Signals the sweeper to stop without waiting for it.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops the sweeper and waits for the task to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("Background expiry sweeper stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one pass and returns `(sampled, expired)` totals.
fn sweep_once(engine: &StorageEngine, sample_size: Option<usize>) -> (usize, usize) {
    let Some(sample) = sample_size else {
        let result = engine.purge_expired(None);
        return (result.sampled, result.expired);
    };

    let mut sampled = 0;
    let mut expired = 0;
    for _ in 0..MAX_SAMPLE_ROUNDS {
        let round = engine.purge_expired(Some(sample));
        sampled += round.sampled;
        expired += round.expired;
        if round.sampled == 0 || round.expired * 4 <= round.sampled {
            break;
        }
    }
    (sampled, expired)
}

/// The main sweeper loop.
async fn sweeper_loop(
    engine: Arc<StorageEngine>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let (sampled, expired) = sweep_once(&engine, config.sample_size);

        if sampled > 0 {
            let expiry_rate = expired as f64 / sampled as f64;

            if expiry_rate > config.speedup_threshold {
                current_interval = (current_interval / 2).max(config.min_interval);
                debug!(
                    expired = expired,
                    rate = %format!("{:.2}%", expiry_rate * 100.0),
                    new_interval_ms = current_interval.as_millis() as u64,
                    "High expiry rate, speeding up sweeper"
                );
            } else if expiry_rate < config.slowdown_threshold && expired == 0 {
                current_interval = (current_interval * 2).min(config.max_interval);
                trace!(
                    new_interval_ms = current_interval.as_millis() as u64,
                    "Low expiry rate, slowing down sweeper"
                );
            }
        } else {
            current_interval = (current_interval * 2).min(config.max_interval);
        }

        if expired > 0 {
            debug!(
                expired = expired,
                keys_remaining = engine.len(),
                "Expired keys cleaned up"
            );
        }
    }
}

/// Starts the expiry sweeper with default configuration.
pub fn start_expiry_sweeper(engine: Arc<StorageEngine>) -> ExpirySweeper {
    ExpirySweeper::start(engine, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fast_config() -> ExpiryConfig {
        ExpiryConfig {
            base_interval: Duration::from_millis(10),
            min_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweeper_cleans_expired_keys() {
        let engine = Arc::new(StorageEngine::new());

        for i in 0..10 {
            engine.set_with_ttl(
                Bytes::from(format!("key{}", i)),
                Bytes::from("value"),
                Duration::from_millis(50),
            );
        }
        engine.set(Bytes::from("persistent"), Bytes::from("value"));
        assert_eq!(engine.len(), 11);

        let sweeper = ExpirySweeper::start(Arc::clone(&engine), fast_config());
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Reclaimed without any read touching the keys.
        assert_eq!(engine.len(), 1);
        assert!(engine.exists(b"persistent"));
        assert_eq!(engine.stats().expired, 10);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sampled_sweeps_drain_everything() {
        let engine = Arc::new(StorageEngine::new());
        for i in 0..500 {
            engine.set_with_ttl(
                Bytes::from(format!("key{}", i)),
                Bytes::from("value"),
                Duration::from_millis(20),
            );
        }

        let config = ExpiryConfig {
            sample_size: Some(20),
            ..fast_config()
        };
        let sweeper = ExpirySweeper::start(Arc::clone(&engine), config);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(engine.len(), 0);
        sweeper.shutdown().await;
    }

    #[test]
    fn test_sweep_once_stops_when_sample_is_mostly_live() {
        let engine = StorageEngine::new();
        for i in 0..50 {
            engine.set_with_ttl(
                Bytes::from(format!("live{}", i)),
                Bytes::from("v"),
                Duration::from_secs(60),
            );
        }
        let (sampled, expired) = sweep_once(&engine, Some(10));
        assert_eq!(sampled, 10);
        assert_eq!(expired, 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let engine = Arc::new(StorageEngine::new());

        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&engine), fast_config());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        engine.set_with_ttl(
            Bytes::from("key"),
            Bytes::from("value"),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The stopped sweeper left it in place.
        assert_eq!(engine.len(), 1);
        // Lazy expiry still hides it.
        assert!(engine.get(b"key").is_none());
    }
}
