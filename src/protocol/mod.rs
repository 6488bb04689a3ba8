//! RESP protocol codec.
//!
//! - `types`: [`RespValue`] and response encoding
//! - `parser`: incremental frame decoding
//! - `request`: validation of request frames into [`Request`]
//!
//! ```
//! use emberkv::protocol::{parse_message, Request, RespValue};
//! use bytes::Bytes;
//!
//! let (frame, consumed) = parse_message(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(consumed, 23);
//! let request = Request::from_frame(frame).unwrap();
//! assert_eq!(request.args()[1], Bytes::from("name"));
//!
//! let reply = RespValue::bulk_string(Bytes::from("Ariz"));
//! assert_eq!(reply.serialize(), b"$4\r\nAriz\r\n");
//! ```

pub mod parser;
pub mod request;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use request::Request;
pub use types::RespValue;
