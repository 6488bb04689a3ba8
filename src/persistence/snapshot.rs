//! Point-in-time snapshot files.
//!
//! ## Format
//!
//! JSON lines. The first line is a header, then one line per key:
//!
//! ```text
//! {"version":1,"created_at_ms":1767225600000,"wal_cutoff":42,"entries":2}
//! {"key":"6e616d65","value":{"type":"string","data":"41726978"}}
//! {"key":"75736572","value":{"type":"hash","data":[["6964","31"]]},"expires_at_ms":1767225659000}
//! ```
//!
//! Keys and values are hex-encoded so arbitrary bytes survive. `expires_at_ms`
//! is an absolute Unix-millisecond deadline. A key whose deadline passed while
//! the file sat on disk is still loaded: the WAL tail replayed on top of the
//! snapshot must see it exactly as the live server did.

use crate::persistence::{PersistenceError, RecoveryError};
use crate::storage::clock;
use crate::storage::{DumpEntry, Value};
use bytes::Bytes;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Bytes stored as a lowercase hex string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HexBytes(Vec<u8>);

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(&text).map(HexBytes).map_err(de::Error::custom)
    }
}

impl From<&Bytes> for HexBytes {
    fn from(bytes: &Bytes) -> Self {
        HexBytes(bytes.to_vec())
    }
}

impl From<HexBytes> for Bytes {
    fn from(hex: HexBytes) -> Self {
        Bytes::from(hex.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u32,
    created_at_ms: u64,
    wal_cutoff: u64,
    entries: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum StoredValue {
    String(HexBytes),
    Hash(Vec<(HexBytes, HexBytes)>),
    List(Vec<HexBytes>),
    Set(Vec<HexBytes>),
}

impl From<&Value> for StoredValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(data) => StoredValue::String(data.into()),
            Value::Hash(fields) => StoredValue::Hash(
                fields.iter().map(|(f, v)| (f.into(), v.into())).collect(),
            ),
            Value::List(items) => StoredValue::List(items.iter().map(HexBytes::from).collect()),
            Value::Set(members) => StoredValue::Set(members.iter().map(HexBytes::from).collect()),
        }
    }
}

impl From<StoredValue> for Value {
    fn from(stored: StoredValue) -> Self {
        match stored {
            StoredValue::String(data) => Value::String(data.into()),
            StoredValue::Hash(fields) => Value::Hash(
                fields
                    .into_iter()
                    .map(|(f, v)| (f.into(), v.into()))
                    .collect(),
            ),
            StoredValue::List(items) => Value::List(items.into_iter().map(Bytes::from).collect()),
            StoredValue::Set(members) => Value::Set(members.into_iter().map(Bytes::from).collect()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: HexBytes,
    value: StoredValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

/// A consistent copy of the key space.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub created_at_ms: u64,
    /// Highest WAL sequence whose effect is included.
    pub wal_cutoff: u64,
    pub entries: Vec<DumpEntry>,
}

impl Snapshot {
    pub fn new(entries: Vec<DumpEntry>, wal_cutoff: u64) -> Self {
        Self {
            created_at_ms: clock::now_ms(),
            wal_cutoff,
            entries,
        }
    }

    /// Writes the snapshot to `<path>.tmp`, syncs it, then renames it over `path`.
    ///
    /// Blocking; run it off the async workers.
    pub fn write_to(&self, path: &Path) -> Result<(), PersistenceError> {
        let tmp = path.with_extension("tmp");
        let write = || -> Result<(), PersistenceError> {
            let mut out = BufWriter::new(File::create(&tmp).map_err(PersistenceError::Snapshot)?);

            let header = Header {
                version: SNAPSHOT_VERSION,
                created_at_ms: self.created_at_ms,
                wal_cutoff: self.wal_cutoff,
                entries: self.entries.len() as u64,
            };
            serde_json::to_writer(&mut out, &header)?;
            out.write_all(b"\n").map_err(PersistenceError::Snapshot)?;

            for entry in &self.entries {
                let stored = StoredEntry {
                    key: (&entry.key).into(),
                    value: (&entry.value).into(),
                    expires_at_ms: entry.expires_at_ms,
                };
                serde_json::to_writer(&mut out, &stored)?;
                out.write_all(b"\n").map_err(PersistenceError::Snapshot)?;
            }

            out.flush().map_err(PersistenceError::Snapshot)?;
            out.get_ref().sync_all().map_err(PersistenceError::Snapshot)?;
            fs::rename(&tmp, path).map_err(PersistenceError::Snapshot)?;
            Ok(())
        };

        write().inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }

    /// Reads a snapshot. A missing file is `Ok(None)`; anything unreadable is an error.
    pub fn load(path: &Path) -> Result<Option<Self>, RecoveryError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(RecoveryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let corrupt = |line: usize, reason: String| RecoveryError::CorruptSnapshot {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let mut lines = BufReader::new(file).lines();
        let header_line = match lines.next() {
            Some(line) => line.map_err(|e| corrupt(1, e.to_string()))?,
            None => return Err(corrupt(1, "missing header".to_string())),
        };
        let header: Header =
            serde_json::from_str(&header_line).map_err(|e| corrupt(1, e.to_string()))?;
        if header.version != SNAPSHOT_VERSION {
            return Err(corrupt(
                1,
                format!("unsupported version {}", header.version),
            ));
        }

        let mut entries = Vec::with_capacity(header.entries as usize);
        let mut seen = 0u64;
        for (index, line) in lines.enumerate() {
            let line_no = index + 2;
            let line = line.map_err(|e| corrupt(line_no, e.to_string()))?;
            let stored: StoredEntry =
                serde_json::from_str(&line).map_err(|e| corrupt(line_no, e.to_string()))?;
            seen += 1;

            entries.push(DumpEntry {
                key: stored.key.into(),
                value: stored.value.into(),
                expires_at_ms: stored.expires_at_ms,
            });
        }

        if seen != header.entries {
            return Err(corrupt(
                seen as usize + 1,
                format!("expected {} entries, found {}", header.entries, seen),
            ));
        }

        Ok(Some(Self {
            created_at_ms: header.created_at_ms,
            wal_cutoff: header.wal_cutoff,
            entries,
        }))
    }
}
