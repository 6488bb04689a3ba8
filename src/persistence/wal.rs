//! Append-only write-ahead log.
//!
//! Every record is written and flushed to the OS before [`Wal::append`]
//! returns. Whether it also reaches the disk depends on the [`FsyncPolicy`].

use crate::persistence::record::{self, RecordError, WalRecord};
use bytes::Bytes;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// When appended records are forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// `sync_data` after every append, before the client sees a reply.
    Always,
    /// A background task syncs once per second.
    #[default]
    EverySec,
    /// Left to the operating system.
    No,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown fsync policy '{0}' (expected always, everysec or no)")]
pub struct UnknownFsyncPolicy(pub String);

impl FromStr for FsyncPolicy {
    type Err = UnknownFsyncPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(UnknownFsyncPolicy(s.to_string())),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::EverySec => "everysec",
            FsyncPolicy::No => "no",
        };
        f.write_str(name)
    }
}

/// Where reading a log file stopped.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: RecordError,
    },
}

/// Everything recovered from a log file.
#[derive(Debug, Default)]
pub struct WalContents {
    pub records: Vec<WalRecord>,
    /// Length of the file up to and including the last complete line.
    pub valid_len: u64,
    /// Bytes of a final line that was never terminated (a write torn by a crash).
    pub torn_bytes: usize,
}

/// Reads every record in `path`. A missing file reads as empty.
///
/// A final line without its `\n` is reported in `torn_bytes` and skipped;
/// any other malformed line is an error.
pub fn read_records(path: &Path) -> Result<WalContents, ReadError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(WalContents::default()),
        Err(e) => return Err(e.into()),
    };

    let mut contents = WalContents::default();
    let mut start = 0;
    let mut line_no = 0;
    while start < data.len() {
        let Some(offset) = data[start..].iter().position(|&b| b == b'\n') else {
            contents.torn_bytes = data.len() - start;
            break;
        };
        line_no += 1;
        let end = start + offset + 1;
        let record = record::decode(&data[start..end]).map_err(|source| ReadError::Corrupt {
            line: line_no,
            source,
        })?;
        contents.records.push(record);
        contents.valid_len = end as u64;
        start = end;
    }
    Ok(contents)
}

/// An open log file.
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    policy: FsyncPolicy,
    /// Records flushed to the OS but not yet synced.
    pending_sync: bool,
}

impl fmt::Debug for Wal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("pending_sync", &self.pending_sync)
            .finish()
    }
}

impl Wal {
    /// Opens (creating if needed) the log for appending.
    pub fn open(path: impl Into<PathBuf>, policy: FsyncPolicy) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            policy,
            pending_sync: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Appends one record and flushes it.
    pub fn append(&mut self, seq: u64, timestamp_ms: u64, args: &[Bytes]) -> io::Result<()> {
        self.writer.write_all(&record::encode(seq, timestamp_ms, args))?;
        self.writer.flush()?;

        if self.policy == FsyncPolicy::Always {
            self.writer.get_ref().sync_data()?;
        } else {
            self.pending_sync = true;
        }
        Ok(())
    }

    /// Flushes and syncs anything not yet on disk.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        if self.pending_sync {
            self.writer.get_ref().sync_data()?;
            self.pending_sync = false;
        }
        Ok(())
    }

    /// Drops every record with `seq <= cutoff`.
    ///
    /// The caller must hold the log lock so no append runs concurrently.
    /// Surviving records are rewritten to a temp file which replaces the log.
    /// The replacement is opened before the rename, so on any error the
    /// current file and writer stay in place.
    pub fn compact(&mut self, cutoff: u64) -> io::Result<()> {
        self.writer.flush()?;

        let contents = read_records(&self.path).map_err(|e| match e {
            ReadError::Io(e) => e,
            corrupt => io::Error::new(io::ErrorKind::InvalidData, corrupt.to_string()),
        })?;
        let kept: Vec<_> = contents
            .records
            .into_iter()
            .filter(|record| record.seq > cutoff)
            .collect();

        if kept.is_empty() {
            let file = self.writer.get_ref();
            file.set_len(0)?;
            file.sync_all()?;
        } else {
            let tmp = self.path.with_extension("compact.tmp");
            let replacement = write_compacted(&tmp, &kept)
                .and_then(|()| OpenOptions::new().append(true).open(&tmp))
                .and_then(|file| fs::rename(&tmp, &self.path).map(|()| file));
            match replacement {
                Ok(file) => self.writer = BufWriter::new(file),
                Err(e) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(e);
                }
            }
        }

        self.pending_sync = false;
        debug!(path = %self.path.display(), cutoff, kept = kept.len(), "WAL compacted");
        Ok(())
    }
}

fn write_compacted(path: &Path, records: &[WalRecord]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for record in records {
        out.write_all(&record::encode_record(record))?;
    }
    out.flush()?;
    out.get_ref().sync_all()
}
