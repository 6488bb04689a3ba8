//! Storage Engine Module
//!
//! The in-memory key space, value types, glob matching for `KEYS`, and the
//! background expiry sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │   RwLock<Keyspace { values, expires, deadlines }>           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::{StorageEngine, KeyTtl};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//!
//! engine.set(Bytes::from("name"), Bytes::from("Ariz"));
//! assert_eq!(engine.get(b"name"), Some(Bytes::from("Ariz")));
//!
//! engine.set_with_ttl(
//!     Bytes::from("session"),
//!     Bytes::from("token123"),
//!     Duration::from_secs(3600),
//! );
//! assert_eq!(engine.ttl(b"missing"), KeyTtl::Missing);
//! ```

pub mod clock;
pub mod engine;
pub mod expiry;
pub mod pattern;
pub mod value;

pub use engine::{DumpEntry, KeyTtl, StorageEngine, StorageError, StorageStats, SweepResult};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};
pub use pattern::GlobPattern;
pub use value::Value;
