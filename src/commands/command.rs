//! Typed commands.
//!
//! [`Command::parse`] turns a request's argument list into a [`Command`],
//! checking the verb, the argument count and numeric arguments. Nothing is
//! executed here.

use crate::protocol::RespValue;
use crate::storage::StorageError;
use bytes::Bytes;
use thiserror::Error;

/// Errors reported to the client as `-ERR ...` / `-WRONGTYPE ...` replies.
///
/// None of them closes the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR empty command")]
    Empty,

    #[error("ERR unknown command '{0}'")]
    Unknown(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpireTime(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<CommandError> for RespValue {
    fn from(err: CommandError) -> Self {
        RespValue::error(err.to_string())
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping { message: Option<Bytes> },
    Set { key: Bytes, value: Bytes },
    Get { key: Bytes },
    Del { keys: Vec<Bytes> },
    Exists { keys: Vec<Bytes> },
    Expire { key: Bytes, seconds: i64 },
    /// Absolute deadline in Unix milliseconds. The WAL form of `EXPIRE`.
    PExpireAt { key: Bytes, unix_ms: i64 },
    Ttl { key: Bytes },
    Keys { pattern: Bytes },
    HSet { key: Bytes, field: Bytes, value: Bytes },
    HGet { key: Bytes, field: Bytes },
    HDel { key: Bytes, fields: Vec<Bytes> },
    Incr { key: Bytes },
    Decr { key: Bytes },
    Type { key: Bytes },
}

/// Checks `args.len()` (arguments after the verb) against `min..=max`.
fn check_arity(
    name: &'static str,
    args: &[Bytes],
    min: usize,
    max: Option<usize>,
) -> Result<(), CommandError> {
    let count = args.len();
    if count < min || max.is_some_and(|max| count > max) {
        return Err(CommandError::WrongArity(name));
    }
    Ok(())
}

fn parse_i64(arg: &Bytes) -> Result<i64, CommandError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CommandError::NotInteger)
}

impl Command {
    /// Parses `[verb, args...]`. The verb is case-insensitive.
    pub fn parse(parts: &[Bytes]) -> Result<Command, CommandError> {
        let Some((verb, args)) = parts.split_first() else {
            return Err(CommandError::Empty);
        };
        let verb = String::from_utf8_lossy(verb).to_ascii_uppercase();

        let command = match verb.as_str() {
            "PING" => {
                check_arity("ping", args, 0, Some(1))?;
                Command::Ping {
                    message: args.first().cloned(),
                }
            }
            "SET" => {
                check_arity("set", args, 2, Some(2))?;
                Command::Set {
                    key: args[0].clone(),
                    value: args[1].clone(),
                }
            }
            "GET" => {
                check_arity("get", args, 1, Some(1))?;
                Command::Get {
                    key: args[0].clone(),
                }
            }
            "DEL" => {
                check_arity("del", args, 1, None)?;
                Command::Del {
                    keys: args.to_vec(),
                }
            }
            "EXISTS" => {
                check_arity("exists", args, 1, None)?;
                Command::Exists {
                    keys: args.to_vec(),
                }
            }
            "EXPIRE" => {
                check_arity("expire", args, 2, Some(2))?;
                Command::Expire {
                    key: args[0].clone(),
                    seconds: parse_i64(&args[1])?,
                }
            }
            "PEXPIREAT" => {
                check_arity("pexpireat", args, 2, Some(2))?;
                Command::PExpireAt {
                    key: args[0].clone(),
                    unix_ms: parse_i64(&args[1])?,
                }
            }
            "TTL" => {
                check_arity("ttl", args, 1, Some(1))?;
                Command::Ttl {
                    key: args[0].clone(),
                }
            }
            "KEYS" => {
                check_arity("keys", args, 0, Some(1))?;
                Command::Keys {
                    pattern: args
                        .first()
                        .cloned()
                        .unwrap_or_else(|| Bytes::from_static(b"*")),
                }
            }
            "HSET" => {
                check_arity("hset", args, 3, Some(3))?;
                Command::HSet {
                    key: args[0].clone(),
                    field: args[1].clone(),
                    value: args[2].clone(),
                }
            }
            "HGET" => {
                check_arity("hget", args, 2, Some(2))?;
                Command::HGet {
                    key: args[0].clone(),
                    field: args[1].clone(),
                }
            }
            "HDEL" => {
                check_arity("hdel", args, 2, None)?;
                Command::HDel {
                    key: args[0].clone(),
                    fields: args[1..].to_vec(),
                }
            }
            "INCR" => {
                check_arity("incr", args, 1, Some(1))?;
                Command::Incr {
                    key: args[0].clone(),
                }
            }
            "DECR" => {
                check_arity("decr", args, 1, Some(1))?;
                Command::Decr {
                    key: args[0].clone(),
                }
            }
            "TYPE" => {
                check_arity("type", args, 1, Some(1))?;
                Command::Type {
                    key: args[0].clone(),
                }
            }
            _ => return Err(CommandError::Unknown(verb)),
        };
        Ok(command)
    }

    /// Lower-case command name.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Ping { .. } => "ping",
            Command::Set { .. } => "set",
            Command::Get { .. } => "get",
            Command::Del { .. } => "del",
            Command::Exists { .. } => "exists",
            Command::Expire { .. } => "expire",
            Command::PExpireAt { .. } => "pexpireat",
            Command::Ttl { .. } => "ttl",
            Command::Keys { .. } => "keys",
            Command::HSet { .. } => "hset",
            Command::HGet { .. } => "hget",
            Command::HDel { .. } => "hdel",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::Type { .. } => "type",
        }
    }

    /// Whether the command can change the key space and so goes through the log.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Set { .. }
                | Command::Del { .. }
                | Command::Expire { .. }
                | Command::PExpireAt { .. }
                | Command::HSet { .. }
                | Command::HDel { .. }
                | Command::Incr { .. }
                | Command::Decr { .. }
        )
    }

    /// The command as an argument list with an upper-case verb.
    pub fn to_args(&self) -> Vec<Bytes> {
        fn verb(name: &'static str) -> Bytes {
            Bytes::from(name.to_ascii_uppercase())
        }
        fn number(n: i64) -> Bytes {
            Bytes::from(n.to_string())
        }

        let mut args = vec![verb(self.name())];
        match self {
            Command::Ping { message } => args.extend(message.iter().cloned()),
            Command::Set { key, value } => args.extend([key.clone(), value.clone()]),
            Command::Get { key }
            | Command::Ttl { key }
            | Command::Incr { key }
            | Command::Decr { key }
            | Command::Type { key } => args.push(key.clone()),
            Command::Del { keys } | Command::Exists { keys } => args.extend(keys.iter().cloned()),
            Command::Expire { key, seconds } => args.extend([key.clone(), number(*seconds)]),
            Command::PExpireAt { key, unix_ms } => args.extend([key.clone(), number(*unix_ms)]),
            Command::Keys { pattern } => args.push(pattern.clone()),
            Command::HSet { key, field, value } => {
                args.extend([key.clone(), field.clone(), value.clone()])
            }
            Command::HGet { key, field } => args.extend([key.clone(), field.clone()]),
            Command::HDel { key, fields } => {
                args.push(key.clone());
                args.extend(fields.iter().cloned());
            }
        }
        args
    }
}
