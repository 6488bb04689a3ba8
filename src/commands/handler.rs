//! Command Handler Module
//!
//! Executes validated commands against the storage engine and records
//! mutations in the write-ahead log.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │   parse()   │───>│  dispatch() │───>│   apply()   │     │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘     │
//! │                            │ log lock         │             │
//! │                            ▼                  ▼             │
//! │                       Persistence       StorageEngine       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Mutations take the log lock before they touch the engine and release it
//! only after their record is appended. Read-only commands never wait on it.
//! A mutation runs with the expiry clock pinned to one instant, and that
//! instant is logged with it so replay sees the same deadlines expire.
//! A mutation that changes nothing (a `DEL` of absent keys, an `EXPIRE` on a
//! missing key) and a failed command are not logged.

use crate::commands::command::{Command, CommandError};
use crate::persistence::{Persistence, PersistenceError};
use crate::protocol::{Request, RespValue};
use crate::storage::{clock, StorageEngine};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{trace, warn};

/// What a dispatched request produced.
#[derive(Debug)]
pub struct Outcome {
    /// Reply for the client.
    pub response: RespValue,
    /// Set when the mutation was applied but could not be logged.
    pub durability_warning: Option<PersistenceError>,
}

impl Outcome {
    fn reply(response: RespValue) -> Self {
        Self {
            response,
            durability_warning: None,
        }
    }
}

/// Result of applying a command to the engine.
struct Applied {
    response: RespValue,
    /// Canonical WAL arguments, present only when state changed.
    record: Option<Vec<Bytes>>,
}

impl Applied {
    fn read(response: RespValue) -> Self {
        Self {
            response,
            record: None,
        }
    }

    fn logged(response: RespValue, record: Vec<Bytes>) -> Self {
        Self {
            response,
            record: Some(record),
        }
    }
}

/// Handles commands by dispatching them to the storage engine.
#[derive(Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    persistence: Arc<Persistence>,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>, persistence: Arc<Persistence>) -> Self {
        Self {
            storage,
            persistence,
        }
    }

    /// A handler that keeps nothing on disk.
    pub fn in_memory(storage: Arc<StorageEngine>) -> Self {
        Self::new(storage, Arc::new(Persistence::disabled()))
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// Executes a request and returns the reply for the client.
    pub async fn execute(&self, request: Request) -> RespValue {
        self.dispatch(request).await.response
    }

    /// Executes a request, reporting durability failures alongside the reply.
    pub async fn dispatch(&self, request: Request) -> Outcome {
        let command = match Command::parse(request.args()) {
            Ok(command) => command,
            Err(e) => return Outcome::reply(e.into()),
        };
        trace!(command = command.name(), "Dispatching");

        if !command.is_mutating() {
            return Outcome::reply(self.apply_or_error(command));
        }

        let mut log = self.persistence.begin().await;
        let now = clock::now_ms();
        let applied = match clock::at(now, || self.apply(command)) {
            Ok(applied) => applied,
            Err(e) => return Outcome::reply(e.into()),
        };
        let durability_warning = match &applied.record {
            Some(record) => log.append(now, record).err(),
            None => None,
        };
        drop(log);

        if let Some(e) = &durability_warning {
            warn!(error = %e, "Mutation applied but not logged");
        }

        Outcome {
            response: applied.response,
            durability_warning,
        }
    }

    /// Re-executes a logged command during recovery. Nothing is logged.
    ///
    /// With `timestamp_ms` the command sees the clock as it was when it was
    /// logged. Any error means the log does not match the state it is
    /// replayed onto.
    pub fn replay(
        &self,
        args: &[Bytes],
        timestamp_ms: Option<u64>,
    ) -> Result<RespValue, CommandError> {
        let command = Command::parse(args)?;
        let apply = || self.apply(command).map(|applied| applied.response);
        match timestamp_ms {
            Some(now) => clock::at(now, apply),
            None => apply(),
        }
    }

    fn apply_or_error(&self, command: Command) -> RespValue {
        match self.apply(command) {
            Ok(applied) => applied.response,
            Err(e) => e.into(),
        }
    }

    fn apply(&self, command: Command) -> Result<Applied, CommandError> {
        match command {
            Command::Ping { message } => Ok(self.cmd_ping(message)),
            Command::Set { key, value } => Ok(self.cmd_set(key, value)),
            Command::Get { key } => Ok(self.cmd_get(&key)),
            Command::Del { keys } => Ok(self.cmd_del(keys)),
            Command::Exists { keys } => Ok(self.cmd_exists(&keys)),
            Command::Expire { key, seconds } => self.cmd_expire(key, seconds),
            Command::PExpireAt { key, unix_ms } => Ok(self.cmd_pexpireat(key, unix_ms)),
            Command::Ttl { key } => Ok(self.cmd_ttl(&key)),
            Command::Keys { pattern } => Ok(self.cmd_keys(&pattern)),
            Command::HSet { key, field, value } => Ok(self.cmd_hset(key, field, value)),
            Command::HGet { key, field } => Ok(self.cmd_hget(&key, &field)),
            Command::HDel { key, fields } => Ok(self.cmd_hdel(key, fields)),
            Command::Incr { key } => self.cmd_incr_by(key, 1),
            Command::Decr { key } => self.cmd_incr_by(key, -1),
            Command::Type { key } => Ok(self.cmd_type(&key)),
        }
    }

    // ========================================================================
    // Strings
    // ========================================================================

    fn cmd_ping(&self, message: Option<Bytes>) -> Applied {
        Applied::read(match message {
            Some(message) => RespValue::bulk_string(message),
            None => RespValue::pong(),
        })
    }

    fn cmd_set(&self, key: Bytes, value: Bytes) -> Applied {
        let record = Command::Set {
            key: key.clone(),
            value: value.clone(),
        }
        .to_args();
        self.storage.set(key, value);
        Applied::logged(RespValue::ok(), record)
    }

    fn cmd_get(&self, key: &[u8]) -> Applied {
        Applied::read(RespValue::optional_bulk(self.storage.get(key)))
    }

    fn cmd_incr_by(&self, key: Bytes, delta: i64) -> Result<Applied, CommandError> {
        let value = self.storage.incr_by(&key, delta)?;
        let record = if delta > 0 {
            Command::Incr { key }
        } else {
            Command::Decr { key }
        };
        Ok(Applied::logged(RespValue::integer(value), record.to_args()))
    }

    // ========================================================================
    // Keys
    // ========================================================================

    fn cmd_del(&self, keys: Vec<Bytes>) -> Applied {
        let removed = self.storage.delete_many(&keys);
        let response = RespValue::integer(removed as i64);
        if removed == 0 {
            return Applied::read(response);
        }
        Applied::logged(response, Command::Del { keys }.to_args())
    }

    fn cmd_exists(&self, keys: &[Bytes]) -> Applied {
        Applied::read(RespValue::integer(self.storage.exists_many(keys) as i64))
    }

    /// `EXPIRE` is logged as the equivalent `PEXPIREAT` so replay lands on
    /// the same deadline instead of restarting the countdown.
    fn cmd_expire(&self, key: Bytes, seconds: i64) -> Result<Applied, CommandError> {
        let unix_ms = seconds
            .checked_mul(1000)
            .and_then(|ms| ms.checked_add(clock::now_ms() as i64))
            .ok_or(CommandError::InvalidExpireTime("expire"))?;
        Ok(self.cmd_pexpireat(key, unix_ms))
    }

    fn cmd_pexpireat(&self, key: Bytes, unix_ms: i64) -> Applied {
        if !self.storage.expire_at(&key, unix_ms.max(0) as u64) {
            return Applied::read(RespValue::integer(0));
        }
        Applied::logged(
            RespValue::integer(1),
            Command::PExpireAt { key, unix_ms }.to_args(),
        )
    }

    fn cmd_ttl(&self, key: &[u8]) -> Applied {
        Applied::read(RespValue::integer(self.storage.ttl(key).as_seconds()))
    }

    fn cmd_keys(&self, pattern: &[u8]) -> Applied {
        let keys = self
            .storage
            .keys(pattern)
            .into_iter()
            .map(RespValue::bulk_string)
            .collect();
        Applied::read(RespValue::array(keys))
    }

    fn cmd_type(&self, key: &[u8]) -> Applied {
        Applied::read(RespValue::simple_string(self.storage.key_type(key)))
    }

    // ========================================================================
    // Hashes
    // ========================================================================

    fn cmd_hset(&self, key: Bytes, field: Bytes, value: Bytes) -> Applied {
        let record = Command::HSet {
            key: key.clone(),
            field: field.clone(),
            value: value.clone(),
        }
        .to_args();
        self.storage.hset(key, field, value);
        Applied::logged(RespValue::integer(1), record)
    }

    fn cmd_hget(&self, key: &[u8], field: &[u8]) -> Applied {
        Applied::read(RespValue::optional_bulk(self.storage.hget(key, field)))
    }

    fn cmd_hdel(&self, key: Bytes, fields: Vec<Bytes>) -> Applied {
        let removed = self.storage.hdel(&key, &fields);
        let response = RespValue::integer(removed as i64);
        if removed == 0 {
            return Applied::read(response);
        }
        Applied::logged(response, Command::HDel { key, fields }.to_args())
    }
}
