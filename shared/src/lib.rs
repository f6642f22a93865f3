// shared/src/lib.rs

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid value type: expected bytes, found {found}")]
    InvalidValueType { found: &'static str },
    #[error("not found")]
    NotFound,
    #[error("{context}: {reason}")]
    Transport { context: String, reason: String },
    #[error("failed to set expiration for {key}: {reason} (value was stored without a TTL)")]
    Expiration { key: String, reason: String },
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not supported by this datastore")]
    Unsupported(&'static str),
    #[error("config: {0}")]
    Config(String),
}

/// Coarse classification callers can branch on without matching every variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidValueType,
    NotFound,
    Transport,
    Unsupported,
    Config,
}

impl Error {
    pub fn transport(context: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidValueType { .. } => ErrorKind::InvalidValueType,
            Error::NotFound => ErrorKind::NotFound,
            Error::Transport { .. } | Error::Expiration { .. } | Error::Protocol(_) | Error::Io(_) => {
                ErrorKind::Transport
            }
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    /// True when the value write went through but its expiration did not.
    pub fn value_may_lack_ttl(&self) -> bool {
        matches!(self, Error::Expiration { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod config;
