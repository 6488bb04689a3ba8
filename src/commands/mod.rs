//! Command Handler Module
//!
//! Receives decoded requests, executes them against the storage engine and
//! returns replies. Mutations are recorded in the write-ahead log before the
//! reply is produced.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RESP Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Command::parse  │  arity and argument checks
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │ CommandHandler  │─────>│  Persistence    │  (mutations only)
//! └────────┬────────┘      └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `PING [message]`
//! - `SET key value`, `GET key`, `INCR key`, `DECR key`
//! - `DEL key [key ...]`, `EXISTS key [key ...]`, `TYPE key`, `KEYS [pattern]`
//! - `EXPIRE key seconds`, `PEXPIREAT key unix-ms`, `TTL key`
//! - `HSET key field value`, `HGET key field`, `HDEL key field [field ...]`

pub mod command;
pub mod handler;

pub use command::{Command, CommandError};
pub use handler::{CommandHandler, Outcome};
