use crate::domain::Key;
use bytes::Bytes;
use shared::{Error, Result};
use std::time::Duration;

/// A single request for the remote cache: a command name followed by
/// binary-safe arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn set(key: &Key, value: Bytes) -> Self {
        Command::new("SET").arg(key.to_string()).arg(value)
    }

    /// `EXPIRE` for whole seconds, `PEXPIRE` when the TTL has a sub-second part.
    pub fn expire(key: &Key, ttl: Duration) -> Self {
        if ttl.subsec_nanos() == 0 {
            Command::new("EXPIRE")
                .arg(key.to_string())
                .arg(ttl.as_secs().to_string())
        } else {
            // sub-millisecond remainders round up so the entry never expires early
            let millis = ttl.as_nanos().div_ceil(1_000_000);
            Command::new("PEXPIRE")
                .arg(key.to_string())
                .arg(millis.to_string())
        }
    }

    pub fn get(key: &Key) -> Self {
        Command::new("GET").arg(key.to_string())
    }

    pub fn strlen(key: &Key) -> Self {
        Command::new("STRLEN").arg(key.to_string())
    }

    pub fn exists(key: &Key) -> Self {
        Command::new("EXISTS").arg(key.to_string())
    }

    pub fn del(key: &Key) -> Self {
        Command::new("DEL").arg(key.to_string())
    }

    pub fn auth(password: &str) -> Self {
        Command::new("AUTH").arg(password.to_string())
    }

    pub fn select(database: u32) -> Self {
        Command::new("SELECT").arg(database.to_string())
    }

    pub fn ping() -> Self {
        Command::new("PING")
    }

    pub fn flushall() -> Self {
        Command::new("FLUSHALL")
    }
}

/// One reply read off the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    /// `None` is the nil bulk string the cache sends for absent keys.
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
        }
    }

    /// Turns an error reply into a transport fault carrying `context`.
    pub fn into_result(self, context: &str) -> Result<Reply> {
        match self {
            Reply::Error(msg) => Err(Error::transport(context, msg)),
            other => Ok(other),
        }
    }

    pub fn into_bytes(self, context: &str) -> Result<Bytes> {
        match self.into_result(context)? {
            Reply::Bulk(Some(bytes)) => Ok(bytes),
            Reply::Bulk(None) => Err(Error::NotFound),
            Reply::Status(s) => Ok(Bytes::from(s)),
            other => Err(unexpected(context, "bulk", &other)),
        }
    }

    pub fn into_integer(self, context: &str) -> Result<i64> {
        match self.into_result(context)? {
            Reply::Integer(n) => Ok(n),
            Reply::Bulk(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| Error::Protocol(format!("{context}: bulk reply is not an integer"))),
            other => Err(unexpected(context, "integer", &other)),
        }
    }

    pub fn into_bool(self, context: &str) -> Result<bool> {
        self.into_integer(context).map(|n| n != 0)
    }
}

fn unexpected(context: &str, expected: &str, got: &Reply) -> Error {
    Error::Protocol(format!(
        "{context}: expected {expected} reply, got {}",
        got.kind_name()
    ))
}
