//! Server configuration.
//!
//! Settings come from an optional JSON file, then command-line flags override
//! individual fields. Every field has a default, so an empty file (`{}`) or no
//! file at all is a valid configuration.
//!
//! ```json
//! {
//!   "port": 6380,
//!   "dir": "/var/lib/emberkv",
//!   "appendfsync": "always",
//!   "save": [{ "seconds": 60, "changes": 1 }]
//! }
//! ```

use crate::persistence::{FsyncPolicy, PersistenceConfig, SaveRule, UnknownFsyncPolicy};
use crate::storage::ExpiryConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    FsyncPolicy(#[from] UnknownFsyncPolicy),

    #[error("port must be between 1 and 65535")]
    InvalidPort,

    #[error("sweep_interval_ms must be greater than zero")]
    InvalidSweepInterval,
}

/// Command-line flags.
#[derive(Debug, Default, Parser)]
#[command(name = "emberkv", version, about = "In-memory key-value server with WAL durability")]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for the WAL and snapshot files
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Enable the write-ahead log
    #[arg(long)]
    pub appendonly: Option<bool>,

    /// WAL fsync policy: always, everysec or no
    #[arg(long)]
    pub appendfsync: Option<String>,
}

/// Full server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory holding the WAL and snapshot files.
    pub dir: PathBuf,
    pub appendonly: bool,
    pub appendfilename: String,
    pub appendfsync: String,
    /// Enables scheduled and shutdown snapshots.
    pub snapshot: bool,
    pub dbfilename: String,
    pub save: Vec<SaveRule>,
    pub snapshot_interval_secs: Option<u64>,
    /// Accepted and reported, not enforced.
    pub maxmemory: u64,
    /// Accepted and reported, not enforced.
    pub maxmemory_policy: String,
    pub sweep_interval_ms: u64,
    pub sweep_sample_size: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            dir: PathBuf::from("."),
            appendonly: true,
            appendfilename: "appendonly.aof".to_string(),
            appendfsync: "everysec".to_string(),
            snapshot: true,
            dbfilename: "dump.json".to_string(),
            save: SaveRule::defaults(),
            snapshot_interval_secs: None,
            maxmemory: 0,
            maxmemory_policy: "noeviction".to_string(),
            sweep_interval_ms: 1000,
            sweep_sample_size: None,
            idle_timeout_secs: None,
        }
    }
}

impl Config {
    /// Reads a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads the file named by `--config` (if any), applies the other flags
    /// on top and validates the result.
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(host) = &cli.host {
            config.host = host.clone();
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(dir) = &cli.dir {
            config.dir = dir.clone();
        }
        if let Some(appendonly) = cli.appendonly {
            config.appendonly = appendonly;
        }
        if let Some(policy) = &cli.appendfsync {
            config.appendfsync = policy.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }
        self.fsync_policy()?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn fsync_policy(&self) -> Result<FsyncPolicy, ConfigError> {
        Ok(self.appendfsync.parse()?)
    }

    pub fn persistence(&self) -> Result<PersistenceConfig, ConfigError> {
        Ok(PersistenceConfig {
            dir: self.dir.clone(),
            appendonly: self.appendonly,
            appendfilename: self.appendfilename.clone(),
            fsync: self.fsync_policy()?,
            snapshot_enabled: self.snapshot,
            dbfilename: self.dbfilename.clone(),
            save_rules: self.save.clone(),
            snapshot_interval: self.snapshot_interval_secs.map(Duration::from_secs),
        })
    }

    /// Sweeper settings: starts at `sweep_interval_ms` and may speed up to a
    /// tenth of it when many keys are expiring.
    pub fn expiry(&self) -> ExpiryConfig {
        let interval = Duration::from_millis(self.sweep_interval_ms);
        ExpiryConfig {
            base_interval: interval,
            min_interval: (interval / 10).max(Duration::from_millis(1)),
            max_interval: interval,
            sample_size: self.sweep_sample_size,
            ..ExpiryConfig::default()
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
