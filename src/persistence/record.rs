//! WAL record lines.
//!
//! ```text
//! 42 @1767225500000 SET "user:1" "hello world"
//! 43 @1767225500012 PEXPIREAT "user:1" "1767225600000"
//! ```
//!
//! A record is the sequence number, the wall-clock millisecond the command ran
//! at (prefixed with `@`), the upper-case verb, then every argument
//! double-quoted. Replay runs each record at its own timestamp, so expiry
//! decisions come out the same as they did live. Lines without a timestamp
//! are accepted and replay at the current time. Inside quotes `\\`, `\"`, `\n`, `\r` and `\t` are escaped and
//! any other byte outside printable ASCII is written as `\xHH`, so a line never
//! contains a raw newline and arguments round-trip byte for byte.

use bytes::Bytes;
use thiserror::Error;

/// Errors from decoding a single record line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("empty record")]
    Empty,

    #[error("invalid sequence number '{0}'")]
    InvalidSequence(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("missing command verb")]
    MissingVerb,

    #[error("unterminated quoted argument")]
    UnterminatedQuote,

    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    #[error("unexpected byte 0x{byte:02x} at {pos}")]
    UnexpectedByte { byte: u8, pos: usize },
}

/// One decoded WAL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    /// Unix milliseconds at which the command was applied.
    pub timestamp_ms: Option<u64>,
    /// Verb followed by arguments, exactly as they are fed to the dispatcher.
    pub args: Vec<Bytes>,
}

/// Encodes a record line, including its trailing `\n`.
///
/// `args[0]` is the verb and is written bare; the remaining arguments are quoted.
pub fn encode(seq: u64, timestamp_ms: u64, args: &[Bytes]) -> Vec<u8> {
    encode_line(seq, Some(timestamp_ms), args)
}

/// Re-encodes a decoded record, keeping a missing timestamp missing.
pub fn encode_record(record: &WalRecord) -> Vec<u8> {
    encode_line(record.seq, record.timestamp_ms, &record.args)
}

fn encode_line(seq: u64, timestamp_ms: Option<u64>, args: &[Bytes]) -> Vec<u8> {
    let payload: usize = args.iter().map(|a| a.len() + 3).sum();
    let mut line = Vec::with_capacity(payload + 40);
    line.extend_from_slice(seq.to_string().as_bytes());
    if let Some(timestamp_ms) = timestamp_ms {
        line.extend_from_slice(b" @");
        line.extend_from_slice(timestamp_ms.to_string().as_bytes());
    }

    let mut parts = args.iter();
    if let Some(verb) = parts.next() {
        line.push(b' ');
        line.extend(verb.iter().map(u8::to_ascii_uppercase));
    }
    for arg in parts {
        line.push(b' ');
        quote_into(arg, &mut line);
    }
    line.push(b'\n');
    line
}

fn quote_into(arg: &[u8], out: &mut Vec<u8>) {
    out.push(b'"');
    for &byte in arg {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'"' => out.extend_from_slice(b"\\\""),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x20..=0x7e => out.push(byte),
            _ => {
                out.extend_from_slice(b"\\x");
                out.extend_from_slice(hex::encode([byte]).as_bytes());
            }
        }
    }
    out.push(b'"');
}

/// Decodes one line. A trailing `\n` (or `\r\n`) is accepted and ignored.
pub fn decode(line: &[u8]) -> Result<WalRecord, RecordError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.is_empty() {
        return Err(RecordError::Empty);
    }

    let seq_end = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
    let seq_text = String::from_utf8_lossy(&line[..seq_end]);
    let seq = seq_text
        .parse::<u64>()
        .map_err(|_| RecordError::InvalidSequence(seq_text.to_string()))?;

    let mut pos = seq_end;
    let mut timestamp_ms = None;
    if line[pos..].starts_with(b" @") {
        let start = pos + 2;
        let end = line[start..]
            .iter()
            .position(|&b| b == b' ')
            .map(|offset| start + offset)
            .unwrap_or(line.len());
        let text = String::from_utf8_lossy(&line[start..end]);
        timestamp_ms = Some(
            text.parse::<u64>()
                .map_err(|_| RecordError::InvalidTimestamp(text.to_string()))?,
        );
        pos = end;
    }

    let mut args = Vec::new();
    while pos < line.len() {
        // Exactly one separator between tokens.
        if line[pos] != b' ' {
            return Err(RecordError::UnexpectedByte {
                byte: line[pos],
                pos,
            });
        }
        pos += 1;

        let (token, next) = if line.get(pos) == Some(&b'"') {
            unquote(line, pos + 1)?
        } else {
            let end = line[pos..]
                .iter()
                .position(|&b| b == b' ')
                .map(|offset| pos + offset)
                .unwrap_or(line.len());
            if end == pos {
                return Err(RecordError::MissingVerb);
            }
            (line[pos..end].to_vec(), end)
        };
        args.push(Bytes::from(token));
        pos = next;
    }

    if args.is_empty() {
        return Err(RecordError::MissingVerb);
    }
    Ok(WalRecord {
        seq,
        timestamp_ms,
        args,
    })
}

/// Reads a quoted argument whose body starts at `start`. Returns the bytes
/// and the position just past the closing quote.
fn unquote(line: &[u8], start: usize) -> Result<(Vec<u8>, usize), RecordError> {
    let mut out = Vec::new();
    let mut pos = start;
    loop {
        let Some(&byte) = line.get(pos) else {
            return Err(RecordError::UnterminatedQuote);
        };
        match byte {
            b'"' => return Ok((out, pos + 1)),
            b'\\' => {
                let escaped = *line.get(pos + 1).ok_or(RecordError::UnterminatedQuote)?;
                match escaped {
                    b'\\' => out.push(b'\\'),
                    b'"' => out.push(b'"'),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'x' => {
                        let digits = line
                            .get(pos + 2..pos + 4)
                            .ok_or(RecordError::InvalidEscape(pos))?;
                        let decoded =
                            hex::decode(digits).map_err(|_| RecordError::InvalidEscape(pos))?;
                        out.extend_from_slice(&decoded);
                        pos += 2;
                    }
                    _ => return Err(RecordError::InvalidEscape(pos)),
                }
                pos += 2;
            }
            _ => {
                out.push(byte);
                pos += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    #[test]
    fn test_encode_layout() {
        let line = encode(7, 1_700_000_000_123, &args(&[b"set", b"name", b"Ariz"]));
        assert_eq!(line, b"7 @1700000000123 SET \"name\" \"Ariz\"\n");

        let record = decode(&line).unwrap();
        assert_eq!(record.timestamp_ms, Some(1_700_000_000_123));
        assert_eq!(record.args, args(&[b"SET", b"name", b"Ariz"]));
    }

    #[test]
    fn test_timestamp_is_optional() {
        let record = decode(b"3 INCR \"n\"").unwrap();
        assert_eq!(record.seq, 3);
        assert_eq!(record.timestamp_ms, None);
        assert_eq!(record.args, args(&[b"INCR", b"n"]));

        assert!(matches!(
            decode(b"3 @soon INCR \"n\""),
            Err(RecordError::InvalidTimestamp(_))
        ));
        assert_eq!(decode(b"3 @42"), Err(RecordError::MissingVerb));
    }

    #[test]
    fn test_awkward_arguments_survive() {
        let original = args(&[
            b"SET",
            b"key with spaces",
            b"say \"hi\"\nnext line\r\ttab \\ slash \x00\xff\x7f",
        ]);
        let line = encode(99, 5, &original);

        // One physical line regardless of content.
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);

        let record = decode(&line).unwrap();
        assert_eq!(record.seq, 99);
        assert_eq!(record.args, original);
    }

    #[test]
    fn test_empty_argument() {
        let record = decode(&encode(1, 0, &args(&[b"SET", b"k", b""]))).unwrap();
        assert_eq!(record.args[2], Bytes::new());
    }

    #[test]
    fn test_malformed_lines() {
        assert_eq!(decode(b""), Err(RecordError::Empty));
        assert!(matches!(
            decode(b"abc SET \"k\" \"v\""),
            Err(RecordError::InvalidSequence(_))
        ));
        assert_eq!(decode(b"5"), Err(RecordError::MissingVerb));
        assert_eq!(
            decode(b"5 SET \"k\" \"unterminated"),
            Err(RecordError::UnterminatedQuote)
        );
        assert!(matches!(
            decode(b"5 SET \"bad\\q\""),
            Err(RecordError::InvalidEscape(_))
        ));
        assert!(matches!(
            decode(b"5 SET \"k\"\"v\""),
            Err(RecordError::UnexpectedByte { .. })
        ));
        assert!(matches!(
            decode(b"5 SET \"\\xZZ\""),
            Err(RecordError::InvalidEscape(_))
        ));
    }
}
