//! # EmberKV - An In-Memory Key-Value Server with WAL Durability
//!
//! EmberKV speaks the Redis wire protocol (RESP) and keeps its data in memory.
//! Every mutation is appended to a write-ahead log before the client sees the
//! reply, and periodic snapshots bound how much log a restart has to replay.
//!
//! ## Features
//!
//! - **Redis-Compatible**: RESP framing with pipelining
//! - **Typed values**: strings, hashes, integer counters
//! - **TTL Support**: lazy expiry on access plus an adaptive background sweep
//! - **Durability**: append-only log with `always`/`everysec`/`no` fsync
//! - **Snapshots**: atomic JSON-lines dumps and log compaction
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              EmberKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                          ┌────────────────────┼──────────────┐          │
//! │                          ▼                                   ▼          │
//! │  ┌─────────────┐   ┌─────────────────┐        ┌──────────────────────┐  │
//! │  │   RESP      │   │  StorageEngine  │        │     Persistence      │  │
//! │  │   Parser    │   │  (RwLock)       │        │  WAL + Snapshots     │  │
//! │  └─────────────┘   └────────▲────────┘        └──────────▲───────────┘  │
//! │                             │                            │              │
//! │                    ┌────────┴────────┐        ┌──────────┴───────────┐  │
//! │                    │  ExpirySweeper  │        │     Snapshotter      │  │
//! │                    └─────────────────┘        └──────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use emberkv::commands::CommandHandler;
//! use emberkv::persistence::{recover, Persistence, PersistenceConfig};
//! use emberkv::storage::StorageEngine;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(StorageEngine::new());
//!     let persistence = Arc::new(Persistence::new(PersistenceConfig::in_dir("./data")));
//!     let handler = CommandHandler::new(storage, persistence);
//!
//!     // Load the snapshot, replay the log and open it for appending.
//!     let report = recover(&handler).await?;
//!     println!("replayed {} records", report.replayed);
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod protocol;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT: u16 = 6379;

pub const DEFAULT_HOST: &str = "127.0.0.1";
