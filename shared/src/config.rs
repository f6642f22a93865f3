use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Applied to every written entry; `None` means entries never expire.
    pub ttl: Option<Duration>,
    pub password: Option<String>,
    pub database: u32,
    pub io_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Self::DEFAULT_HOST.to_string(),
            port: Self::DEFAULT_PORT,
            ttl: None,
            password: None,
            database: 0,
            io_timeout: None,
        }
    }
}

impl Config {
    const DEFAULT_HOST: &str = "127.0.0.1";
    const DEFAULT_PORT: u16 = 6379;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host = lookup("REDIS_DATASTORE_HOST").unwrap_or_else(|| Self::DEFAULT_HOST.to_string());
        let port = parse_or(&lookup, "REDIS_DATASTORE_PORT", Self::DEFAULT_PORT);
        let ttl = match parse_or(&lookup, "REDIS_DATASTORE_TTL_SECS", 0u64) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let database = parse_or(&lookup, "REDIS_DATASTORE_DB", 0u32);
        let io_timeout = match parse_or(&lookup, "REDIS_DATASTORE_IO_TIMEOUT_MS", 0u64) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Self {
            host,
            port,
            ttl,
            password: lookup("REDIS_DATASTORE_PASSWORD").filter(|p| !p.is_empty()),
            database,
            io_timeout,
        }
    }

    /// A zero TTL means entries never expire.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
        None => default,
    }
}
