//! Incremental RESP parser.
//!
//! The parser works against whatever bytes are currently buffered and returns:
//! - `Ok(Some((value, consumed)))` when a whole frame is available,
//! - `Ok(None)` when the frame is still incomplete,
//! - `Err(ParseError)` when the bytes can never form a valid frame.
//!
//! An incomplete result consumes nothing, so the caller keeps its buffer intact,
//! reads more from the socket, and calls `parse` again. Errors are protocol errors:
//! the connection is expected to be closed, no resynchronisation is attempted.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that make a byte stream unusable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The first byte of a frame is not a RESP type prefix.
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// A length, count or integer field is not a decimal number.
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Simple strings and errors must be UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Structural violation (missing CRLF, non-array request, ...).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest bulk string accepted (512 MiB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Largest element count accepted for an array header.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum array nesting depth.
pub const MAX_NESTING_DEPTH: usize = 32;

/// A RESP frame parser.
///
/// The parser itself holds no buffered bytes; the caller owns the buffer and
/// advances it by the `consumed` count of every complete frame.
#[derive(Debug, Default)]
pub struct RespParser {
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one frame from the start of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        match first {
            prefix::SIMPLE_STRING => Ok(parse_line(buf)?
                .map(|(line, consumed)| (RespValue::SimpleString(line.to_string()), consumed))),
            prefix::ERROR => Ok(parse_line(buf)?
                .map(|(line, consumed)| (RespValue::Error(line.to_string()), consumed))),
            prefix::INTEGER => Ok(parse_number(buf)?
                .map(|(n, consumed)| (RespValue::Integer(n), consumed))),
            prefix::BULK_STRING => parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses `*<count>\r\n<elements...>`.
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, header) = match parse_number(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }
        let count = count as usize;
        if count > MAX_ARRAY_LEN {
            return Err(ParseError::MessageTooLarge {
                size: count,
                max: MAX_ARRAY_LEN,
            });
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        let mut elements = Vec::with_capacity(count.min(64));
        let mut consumed = header;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Parses `$<len>\r\n<data>\r\n`.
fn parse_bulk_string(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    let (length, header) = match parse_number(buf)? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    if length == -1 {
        return Ok(Some((RespValue::Null, header)));
    }
    if length < 0 {
        return Err(ParseError::InvalidBulkLength(length));
    }
    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total = header + length + CRLF.len();
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header + length..total] != CRLF {
        return Err(ParseError::ProtocolError(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header..header + length]);
    Ok(Some((RespValue::BulkString(data), total)))
}

/// Reads the text between the prefix byte and the first CRLF.
fn parse_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let line = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((line, 1 + pos + CRLF.len())))
        }
        None => Ok(None),
    }
}

/// Reads a signed decimal header line (`:`, `$` and `*` frames).
fn parse_number(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    match parse_line(buf)? {
        Some((line, consumed)) => {
            let n = line
                .parse::<i64>()
                .map_err(|_| ParseError::InvalidInteger(line.to_string()))?;
            Ok(Some((n, consumed)))
        }
        None => Ok(None),
    }
}

/// Position of the first `\r\n` in `buf`.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single frame with a throwaway parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(
            parse_message(b"+OK\r\n").unwrap(),
            Some((RespValue::SimpleString("OK".to_string()), 5))
        );
        assert_eq!(
            parse_message(b"-ERR boom\r\n").unwrap(),
            Some((RespValue::Error("ERR boom".to_string()), 11))
        );
        assert_eq!(
            parse_message(b":-42\r\n").unwrap(),
            Some((RespValue::Integer(-42), 6))
        );
    }

    #[test]
    fn test_parse_bulk_strings() {
        assert_eq!(
            parse_message(b"$5\r\nhello\r\n").unwrap(),
            Some((RespValue::BulkString(Bytes::from("hello")), 11))
        );
        assert_eq!(
            parse_message(b"$0\r\n\r\n").unwrap(),
            Some((RespValue::BulkString(Bytes::new()), 6))
        );
        assert_eq!(
            parse_message(b"$-1\r\n").unwrap(),
            Some((RespValue::Null, 5))
        );
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let (value, _) = parse_message(b"$7\r\na\r\nb\x00 c\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::BulkString(Bytes::from(&b"a\r\nb\x00 c"[..])));
    }

    #[test]
    fn test_parse_request_array() {
        let input = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:101\r\n$4\r\nAriz\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("SET")),
                RespValue::BulkString(Bytes::from("user:101")),
                RespValue::BulkString(Bytes::from("Ariz")),
            ])
        );
    }

    #[test]
    fn test_every_prefix_of_a_frame_is_incomplete() {
        let input = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
        for end in 0..input.len() {
            assert_eq!(
                parse_message(&input[..end]).unwrap(),
                None,
                "prefix of length {} should be incomplete",
                end
            );
        }
        assert!(parse_message(input).unwrap().is_some());
    }

    #[test]
    fn test_pipelined_frames_consume_one_at_a_time() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let mut parser = RespParser::new();
        let (_, first) = parser.parse(input).unwrap().unwrap();
        assert_eq!(first, 14);
        let (_, second) = parser.parse(&input[first..]).unwrap().unwrap();
        assert_eq!(first + second, input.len());
    }

    #[test]
    fn test_nested_and_null_arrays() {
        let (value, _) = parse_message(b"*2\r\n:1\r\n*1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Integer(2)]),
            ])
        );
        assert_eq!(parse_message(b"*-1\r\n").unwrap(), Some((RespValue::Null, 5)));
        assert_eq!(
            parse_message(b"*0\r\n").unwrap(),
            Some((RespValue::Array(vec![]), 4))
        );
    }

    #[test]
    fn test_unknown_prefix_is_fatal() {
        assert_eq!(
            parse_message(b"PING\r\n"),
            Err(ParseError::UnknownPrefix(b'P'))
        );
        assert_eq!(
            parse_message(b"*1\r\n@x\r\n"),
            Err(ParseError::UnknownPrefix(b'@'))
        );
    }

    #[test]
    fn test_unparsable_lengths_are_fatal() {
        assert!(matches!(
            parse_message(b"$abc\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert!(matches!(
            parse_message(b"*x\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert_eq!(
            parse_message(b"$-5\r\n"),
            Err(ParseError::InvalidBulkLength(-5))
        );
        assert_eq!(
            parse_message(b"*-3\r\n"),
            Err(ParseError::InvalidArrayLength(-3))
        );
    }

    #[test]
    fn test_bulk_string_without_trailing_crlf() {
        assert!(matches!(
            parse_message(b"$3\r\nabcXY"),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(
            parse_message(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_encoded_request_parses_back() {
        let original = RespValue::Array(vec![
            RespValue::bulk_string(Bytes::from("HSET")),
            RespValue::bulk_string(Bytes::from("user")),
            RespValue::bulk_string(Bytes::from("name")),
            RespValue::bulk_string(Bytes::from("two words")),
        ]);
        let bytes = original.serialize();
        let (parsed, consumed) = parse_message(&bytes).unwrap().unwrap();
        assert_eq!(parsed, original);
        assert_eq!(consumed, bytes.len());
    }
}
