//! Thread-safe key space with per-key expiry.
//!
//! ## Design
//!
//! 1. **One lock**: the whole key space sits behind a single `RwLock`, so every
//!    command observes and mutates a consistent state. Readers share it, writers
//!    get it exclusively, and no method holds it past its own return.
//! 2. **Separate expiry index**: deadlines live beside the values, both as a
//!    per-key map and as a set ordered by deadline, and are always removed
//!    together with the value.
//! 3. **Wall-clock deadlines**: a deadline is an absolute Unix millisecond
//!    read through [`clock`](crate::storage::clock), so the same operations at
//!    the same instants always leave the same state.
//! 4. **Lazy expiry**: every read first checks the deadline; an expired key is
//!    deleted in the same call and reported as absent.
//! 5. **Active expiry**: [`StorageEngine::purge_expired`] reclaims the
//!    soonest deadlines first. The background
//!    [`ExpirySweeper`](crate::storage::ExpirySweeper) drives it.
//!
//! ```text
//! ┌──────────────────────── StorageEngine ────────────────────────┐
//! │  RwLock<Keyspace>                                              │
//! │   ┌──────────────────────┐   ┌──────────────────────────────┐  │
//! │   │ values: key -> Value │   │ expires: key -> unix ms      │  │
//! │   └──────────────────────┘   │ deadlines: (unix ms, key)    │  │
//! │                              └──────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock poisoning is not fatal: no method panics between updating a value and
//! its deadline, so the guard is recovered and used.

use crate::storage::clock;
use crate::storage::pattern::GlobPattern;
use crate::storage::value::Value;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by type-specific operations. None of them mutate state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or just expired).
    Missing,
    /// The key exists without an expiry.
    Persistent,
    /// The key expires after this duration.
    Expires(Duration),
}

impl KeyTtl {
    /// The `TTL` reply: -2 missing, -1 persistent, else seconds rounded to nearest.
    pub fn as_seconds(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::Expires(remaining) => ((remaining.as_millis() + 500) / 1000) as i64,
        }
    }

    /// Same as [`as_seconds`](Self::as_seconds) in milliseconds.
    pub fn as_millis(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::Expires(remaining) => remaining.as_millis() as i64,
        }
    }
}

/// A point-in-time copy of one key, as produced by [`StorageEngine::dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpEntry {
    pub key: Bytes,
    pub value: Value,
    /// Absolute deadline in Unix milliseconds, `None` for persistent keys.
    pub expires_at_ms: Option<u64>,
}

/// Outcome of one active-expiry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepResult {
    /// Expiry-index entries examined.
    pub sampled: usize,
    /// Keys removed.
    pub expired: usize,
}

/// Engine counters.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    /// Keys currently held, including expired keys not yet reclaimed.
    pub keys: u64,
    /// Keys carrying an expiry.
    pub expiring: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    /// Keys removed because their deadline passed.
    pub expired: u64,
}

#[derive(Debug, Default)]
struct Keyspace {
    values: HashMap<Bytes, Value>,
    expires: HashMap<Bytes, u64>,
    /// The entries of `expires`, soonest first.
    deadlines: BTreeSet<(u64, Bytes)>,
}

impl Keyspace {
    #[inline]
    fn is_expired(&self, key: &[u8], now: u64) -> bool {
        self.expires
            .get(key)
            .map(|deadline| now >= *deadline)
            .unwrap_or(false)
    }

    fn set_deadline(&mut self, key: Bytes, deadline: u64) {
        if let Some(previous) = self.expires.insert(key.clone(), deadline) {
            self.deadlines.remove(&(previous, key.clone()));
        }
        self.deadlines.insert((deadline, key));
    }

    /// Returns true if the key had a deadline.
    fn clear_deadline(&mut self, key: &[u8]) -> bool {
        match self.expires.remove_entry(key) {
            Some((key, deadline)) => {
                self.deadlines.remove(&(deadline, key));
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &[u8]) -> Option<Value> {
        self.clear_deadline(key);
        self.values.remove(key)
    }

    /// Deletes `key` if its deadline passed. Returns true if it did.
    fn purge_if_expired(&mut self, key: &[u8], now: u64) -> bool {
        if self.is_expired(key, now) {
            self.remove(key);
            true
        } else {
            false
        }
    }
}

/// The shared key space.
///
/// Wrap it in an `Arc` and hand clones to every connection and background task.
///
/// ```
/// use emberkv::storage::{KeyTtl, StorageEngine};
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let engine = StorageEngine::new();
/// engine.set(Bytes::from("name"), Bytes::from("Ariz"));
/// assert_eq!(engine.get(b"name"), Some(Bytes::from("Ariz")));
///
/// engine.expire(b"name", Duration::from_secs(60));
/// assert!(matches!(engine.ttl(b"name"), KeyTtl::Expires(_)));
/// ```
pub struct StorageEngine {
    keyspace: RwLock<Keyspace>,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("StorageEngine")
            .field("keys", &stats.keys)
            .field("expiring", &stats.expiring)
            .field("expired", &stats.expired)
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            keyspace: RwLock::new(Keyspace::default()),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Keyspace> {
        self.keyspace.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Keyspace> {
        self.keyspace.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_expired(&self, count: usize) {
        if count > 0 {
            self.expired_count.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Looks up a live value and projects it with `f`.
    ///
    /// Fast path under the read lock; an expired key is re-checked and removed
    /// under the write lock before reporting it absent.
    fn with_live<T>(&self, key: &[u8], f: impl Fn(&Value) -> T) -> Option<T> {
        {
            let keyspace = self.read();
            if !keyspace.is_expired(key, clock::now_ms()) {
                return keyspace.values.get(key).map(&f);
            }
        }

        let mut keyspace = self.write();
        if keyspace.purge_if_expired(key, clock::now_ms()) {
            self.record_expired(1);
            return None;
        }
        // Rewritten by another command between the two locks.
        keyspace.values.get(key).map(f)
    }

    /// Removes whichever of `keys` are (still) expired.
    fn purge_keys(&self, keys: &[Bytes]) {
        if keys.is_empty() {
            return;
        }
        let mut keyspace = self.write();
        let now = clock::now_ms();
        let purged = keys
            .iter()
            .filter(|key| keyspace.purge_if_expired(key, now))
            .count();
        self.record_expired(purged);
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Stores a string, replacing any previous value and clearing its expiry.
    ///
    /// Returns true if the key did not exist before.
    pub fn set(&self, key: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut keyspace = self.write();
        let now = clock::now_ms();
        let existed = !keyspace.purge_if_expired(&key, now) && keyspace.values.contains_key(&key);
        keyspace.clear_deadline(&key);
        keyspace.values.insert(key, Value::String(value));
        !existed
    }

    /// Stores a string that expires after `ttl`.
    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut keyspace = self.write();
        let now = clock::now_ms();
        let existed = !keyspace.purge_if_expired(&key, now) && keyspace.values.contains_key(&key);
        keyspace.set_deadline(key.clone(), now.saturating_add(ttl.as_millis() as u64));
        keyspace.values.insert(key, Value::String(value));
        !existed
    }

    /// Returns a string value. Absent keys and other types read as `None`.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.with_live(key, |value| value.as_string().cloned())
            .flatten()
    }

    /// Adds `delta` to an integer string. An absent key counts as 0.
    ///
    /// The key keeps its expiry. On error nothing is modified.
    pub fn incr_by(&self, key: &[u8], delta: i64) -> Result<i64, StorageError> {
        let mut keyspace = self.write();
        if keyspace.purge_if_expired(key, clock::now_ms()) {
            self.record_expired(1);
        }

        let current = match keyspace.values.get(key) {
            None => 0,
            Some(Value::String(data)) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StorageError::NotInteger)?,
            Some(_) => return Err(StorageError::WrongType),
        };

        let updated = current.checked_add(delta).ok_or(StorageError::Overflow)?;
        keyspace.values.insert(
            Bytes::copy_from_slice(key),
            Value::String(Bytes::from(updated.to_string())),
        );
        Ok(updated)
    }

    pub fn incr(&self, key: &[u8]) -> Result<i64, StorageError> {
        self.incr_by(key, 1)
    }

    pub fn decr(&self, key: &[u8]) -> Result<i64, StorageError> {
        self.incr_by(key, -1)
    }

    // ------------------------------------------------------------------
    // Hashes
    // ------------------------------------------------------------------

    /// Sets one hash field. A missing key becomes a hash; a key of another
    /// type is replaced by a fresh hash without expiry.
    ///
    /// Returns true if the field is new.
    pub fn hset(&self, key: Bytes, field: Bytes, value: Bytes) -> bool {
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let mut keyspace = self.write();
        if keyspace.purge_if_expired(&key, clock::now_ms()) {
            self.record_expired(1);
        }

        if let Some(Value::Hash(fields)) = keyspace.values.get_mut(&key) {
            return fields.insert(field, value).is_none();
        }

        keyspace.clear_deadline(&key);
        keyspace
            .values
            .insert(key, Value::Hash(HashMap::from([(field, value)])));
        true
    }

    /// Reads one hash field. Missing key, missing field and wrong type all read as `None`.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.with_live(key, |value| {
            value.as_hash().and_then(|fields| fields.get(field).cloned())
        })
        .flatten()
    }

    /// Removes hash fields and returns how many existed.
    ///
    /// Removing the last field leaves an empty hash under the key.
    pub fn hdel(&self, key: &[u8], fields: &[Bytes]) -> u64 {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut keyspace = self.write();
        if keyspace.purge_if_expired(key, clock::now_ms()) {
            self.record_expired(1);
            return 0;
        }

        match keyspace.values.get_mut(key) {
            Some(Value::Hash(map)) => fields
                .iter()
                .filter(|field| map.remove(&field[..]).is_some())
                .count() as u64,
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Deletes a key. Returns false if it was absent or already expired.
    pub fn delete(&self, key: &[u8]) -> bool {
        self.delete_many(std::slice::from_ref(&Bytes::copy_from_slice(key))) == 1
    }

    /// Deletes several keys under one lock and returns how many existed.
    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut keyspace = self.write();
        let now = clock::now_ms();
        let mut expired = 0;
        let mut deleted = 0;
        for key in keys {
            if keyspace.purge_if_expired(key, now) {
                expired += 1;
            } else if keyspace.remove(key).is_some() {
                deleted += 1;
            }
        }
        self.record_expired(expired);
        deleted
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.with_live(key, |_| ()).is_some()
    }

    /// Counts live keys. A key listed twice counts twice.
    pub fn exists_many(&self, keys: &[Bytes]) -> u64 {
        let mut stale = Vec::new();
        let count = {
            let keyspace = self.read();
            let now = clock::now_ms();
            keys.iter()
                .filter(|key| {
                    if keyspace.is_expired(key, now) {
                        stale.push((*key).clone());
                        false
                    } else {
                        keyspace.values.contains_key(&key[..])
                    }
                })
                .count() as u64
        };
        self.purge_keys(&stale);
        count
    }

    /// Sets the key to expire at `unix_ms` milliseconds since the Unix epoch.
    ///
    /// A deadline at or before now deletes the key immediately. Returns false
    /// if the key does not exist.
    pub fn expire_at(&self, key: &[u8], unix_ms: u64) -> bool {
        let mut keyspace = self.write();
        let now = clock::now_ms();
        if keyspace.purge_if_expired(key, now) {
            self.record_expired(1);
            return false;
        }
        if !keyspace.values.contains_key(key) {
            return false;
        }

        if unix_ms > now {
            keyspace.set_deadline(Bytes::copy_from_slice(key), unix_ms);
        } else {
            keyspace.remove(key);
            self.record_expired(1);
        }
        true
    }

    /// Sets the key to expire after `ttl`. Returns false if it does not exist.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        self.expire_at(
            key,
            clock::now_ms().saturating_add(ttl.as_millis() as u64),
        )
    }

    /// Removes the expiry of a key. Returns true if there was one.
    pub fn persist(&self, key: &[u8]) -> bool {
        let mut keyspace = self.write();
        if keyspace.purge_if_expired(key, clock::now_ms()) {
            self.record_expired(1);
            return false;
        }
        keyspace.clear_deadline(key)
    }

    pub fn ttl(&self, key: &[u8]) -> KeyTtl {
        let now = clock::now_ms();
        let found = self.with_live(key, |_| ());
        if found.is_none() {
            return KeyTtl::Missing;
        }
        match self.read().expires.get(key) {
            Some(deadline) => {
                KeyTtl::Expires(Duration::from_millis(deadline.saturating_sub(now)))
            }
            None => KeyTtl::Persistent,
        }
    }

    /// `string`, `hash`, `list`, `set`, or `none`.
    pub fn key_type(&self, key: &[u8]) -> &'static str {
        self.with_live(key, Value::type_name).unwrap_or("none")
    }

    /// Lists live keys matching a glob pattern.
    ///
    /// This scans the whole key space under the read lock.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let pattern = GlobPattern::new(pattern);
        let mut stale = Vec::new();
        let matched = {
            let keyspace = self.read();
            let now = clock::now_ms();
            let mut matched = Vec::new();
            for key in keyspace.values.keys() {
                if keyspace.is_expired(key, now) {
                    stale.push(key.clone());
                } else if pattern.matches_all() || pattern.matches(key) {
                    matched.push(key.clone());
                }
            }
            matched
        };
        self.purge_keys(&stale);
        matched
    }

    /// Number of keys held, including expired keys not yet reclaimed.
    pub fn len(&self) -> u64 {
        self.read().values.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        let (keys, expiring) = {
            let keyspace = self.read();
            (keyspace.values.len() as u64, keyspace.expires.len() as u64)
        };
        StorageStats {
            keys,
            expiring,
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Active expiry and snapshots
    // ------------------------------------------------------------------

    /// Removes expired keys under the write lock.
    ///
    /// With `sample = Some(n)` only the `n` soonest deadlines are examined,
    /// bounding the time the lock is held. `None` examines the whole index.
    pub fn purge_expired(&self, sample: Option<usize>) -> SweepResult {
        let mut keyspace = self.write();
        let now = clock::now_ms();
        let limit = sample.unwrap_or(usize::MAX);

        // Ordered by deadline: the due entries are a prefix of the sample.
        let sampled = keyspace.deadlines.len().min(limit);
        let due: Vec<Bytes> = keyspace
            .deadlines
            .iter()
            .take(limit)
            .take_while(|(deadline, _)| now >= *deadline)
            .map(|(_, key)| key.clone())
            .collect();
        for key in &due {
            keyspace.remove(key);
        }

        self.record_expired(due.len());
        SweepResult {
            sampled,
            expired: due.len(),
        }
    }

    /// Copies every live key with its deadline.
    pub fn dump(&self) -> Vec<DumpEntry> {
        let keyspace = self.read();
        let now = clock::now_ms();
        keyspace
            .values
            .iter()
            .filter(|(key, _)| !keyspace.is_expired(key, now))
            .map(|(key, value)| DumpEntry {
                key: key.clone(),
                value: value.clone(),
                expires_at_ms: keyspace.expires.get(key).copied(),
            })
            .collect()
    }

    /// Loads dumped entries, overwriting keys that already exist.
    ///
    /// Deadlines are kept as given, even past ones: such keys read as absent
    /// and are reclaimed like any other expired key.
    pub fn restore(&self, entries: impl IntoIterator<Item = DumpEntry>) -> usize {
        let mut keyspace = self.write();
        let mut restored = 0;
        for entry in entries {
            match entry.expires_at_ms {
                Some(deadline) => keyspace.set_deadline(entry.key.clone(), deadline),
                None => {
                    keyspace.clear_deadline(&entry.key);
                }
            }
            keyspace.values.insert(entry.key, entry.value);
            restored += 1;
        }
        restored
    }
}
