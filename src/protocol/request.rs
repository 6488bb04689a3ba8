//! Client requests.
//!
//! A request frame is always an array of bulk strings: the command verb
//! followed by its arguments. Anything else on the request path is a
//! protocol error.

use crate::protocol::parser::ParseError;
use crate::protocol::types::RespValue;
use bytes::Bytes;

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    args: Vec<Bytes>,
}

impl Request {
    /// Builds a request directly from its parts.
    pub fn new(args: Vec<Bytes>) -> Self {
        Self { args }
    }

    /// Validates the shape of a decoded frame.
    pub fn from_frame(frame: RespValue) -> Result<Self, ParseError> {
        let elements = match frame {
            RespValue::Array(elements) => elements,
            other => {
                return Err(ParseError::ProtocolError(format!(
                    "expected an array of bulk strings, got {}",
                    kind(&other)
                )))
            }
        };

        let args = elements
            .into_iter()
            .map(|element| match element {
                RespValue::BulkString(bytes) => Ok(bytes),
                other => Err(ParseError::ProtocolError(format!(
                    "expected bulk string argument, got {}",
                    kind(&other)
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { args })
    }

    /// Verb and arguments, in frame order.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Encodes the request the way a client would send it.
    pub fn to_frame(&self) -> RespValue {
        RespValue::Array(
            self.args
                .iter()
                .cloned()
                .map(RespValue::BulkString)
                .collect(),
        )
    }
}

impl<S: AsRef<[u8]>> From<&[S]> for Request {
    fn from(parts: &[S]) -> Self {
        Self::new(
            parts
                .iter()
                .map(|p| Bytes::copy_from_slice(p.as_ref()))
                .collect(),
        )
    }
}

fn kind(value: &RespValue) -> &'static str {
    match value {
        RespValue::SimpleString(_) => "simple string",
        RespValue::Error(_) => "error",
        RespValue::Integer(_) => "integer",
        RespValue::BulkString(_) => "bulk string",
        RespValue::Null => "null",
        RespValue::Array(_) => "array",
    }
}
