use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use datastore::{Command, Connection, Key, Reply};
use moka::Expiry;
use moka::future::Cache;
use shared::{Error, Result};
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const KNOWN_COMMANDS: &[&str] = &[
    "PING", "SET", "GET", "STRLEN", "EXISTS", "DEL", "EXPIRE", "PEXPIRE", "PTTL", "FLUSHALL",
    "AUTH", "SELECT",
];

#[derive(Clone, Debug)]
struct Stored {
    value: Bytes,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Stored {
    fn persistent(value: Bytes) -> Self {
        Self {
            value,
            ttl: None,
            expires_at: None,
        }
    }

    /// `None` when the deadline is past what `Instant` can represent.
    fn expiring(value: Bytes, ttl: Duration) -> Option<Self> {
        let expires_at = Instant::now().checked_add(ttl)?;
        Some(Self {
            value,
            ttl: Some(ttl),
            expires_at: Some(expires_at),
        })
    }
}

/// Each entry carries its own TTL; every write restarts (or clears) it.
struct PerEntryExpiry;

impl Expiry<Bytes, Stored> for PerEntryExpiry {
    fn expire_after_create(&self, _key: &Bytes, value: &Stored, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &Bytes,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process stand-in for the remote cache, speaking the same command set
/// the datastore adapter uses.
///
/// Clones share state, so a test can keep one handle to inject faults and
/// inspect traffic while the adapter owns another.
#[derive(Clone)]
pub struct MemoryConnection {
    cache: Cache<Bytes, Stored>,
    faults: Arc<DashMap<String, String>>,
    exchanges: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder().expire_after(PerEntryExpiry).build(),
            faults: Arc::new(DashMap::new()),
            exchanges: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every later `name` command answer with an error reply.
    pub fn fail_command(&self, name: &str, message: impl Into<String>) {
        self.faults.insert(name.to_ascii_uppercase(), message.into());
    }

    pub fn clear_fault(&self, name: &str) {
        self.faults.remove(&name.to_ascii_uppercase());
    }

    /// Number of round-trips served so far; a pipeline counts once.
    pub fn exchanges(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `None` when the key is absent, `Some(None)` when it never expires.
    pub async fn remaining_ttl(&self, key: &Key) -> Option<Option<Duration>> {
        let stored = self.cache.get(key.as_str().as_bytes()).await?;
        Some(
            stored
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now())),
        )
    }

    async fn execute(&self, command: &Command) -> Reply {
        let name = command.name().to_ascii_uppercase();
        if let Some(message) = self.faults.get(&name) {
            return Reply::Error(message.clone());
        }

        match (name.as_str(), command.args()) {
            ("PING", []) => Reply::Status("PONG".to_string()),
            ("SET", [key, value]) => {
                self.cache
                    .insert(key.clone(), Stored::persistent(value.clone()))
                    .await;
                Reply::ok()
            }
            ("GET", [key]) => Reply::Bulk(self.cache.get(key).await.map(|s| s.value)),
            ("STRLEN", [key]) => {
                let len = self.cache.get(key).await.map_or(0, |s| s.value.len());
                Reply::Integer(len as i64)
            }
            ("EXISTS", keys) if !keys.is_empty() => {
                let mut count = 0;
                for key in keys {
                    if self.cache.get(key).await.is_some() {
                        count += 1;
                    }
                }
                Reply::Integer(count)
            }
            ("DEL", keys) if !keys.is_empty() => {
                let mut count = 0;
                for key in keys {
                    if self.cache.remove(key).await.is_some() {
                        count += 1;
                    }
                }
                Reply::Integer(count)
            }
            ("EXPIRE", [key, secs]) => match integer(secs) {
                Some(secs) => self.expire("expire", key, secs, Duration::from_secs).await,
                None => not_an_integer(),
            },
            ("PEXPIRE", [key, millis]) => match integer(millis) {
                Some(millis) => self.expire("pexpire", key, millis, Duration::from_millis).await,
                None => not_an_integer(),
            },
            ("PTTL", [key]) => match self.cache.get(key).await {
                None => Reply::Integer(-2),
                Some(Stored {
                    expires_at: None, ..
                }) => Reply::Integer(-1),
                Some(Stored {
                    expires_at: Some(at),
                    ..
                }) => Reply::Integer(at.saturating_duration_since(Instant::now()).as_millis() as i64),
            },
            ("FLUSHALL", []) => {
                self.cache.invalidate_all();
                Reply::ok()
            }
            ("AUTH", [_]) | ("SELECT", [_]) => Reply::ok(),
            (name, _) if KNOWN_COMMANDS.contains(&name) => Reply::Error(format!(
                "ERR wrong number of arguments for '{}' command",
                name.to_ascii_lowercase()
            )),
            (name, _) => Reply::Error(format!("ERR unknown command '{}'", name)),
        }
    }

    async fn expire(
        &self,
        command: &str,
        key: &Bytes,
        amount: i64,
        unit: fn(u64) -> Duration,
    ) -> Reply {
        let Some(stored) = self.cache.get(key).await else {
            return Reply::Integer(0);
        };
        if amount <= 0 {
            // a non-positive TTL deletes the key outright
            self.cache.invalidate(key).await;
        } else {
            let Some(expiring) = Stored::expiring(stored.value, unit(amount as u64)) else {
                return Reply::Error(format!("ERR invalid expire time in '{}' command", command));
            };
            self.cache.insert(key.clone(), expiring).await;
        }
        Reply::Integer(1)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::transport("connection closed", "memory connection"));
        }
        Ok(())
    }
}

fn integer(arg: &Bytes) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn not_an_integer() -> Reply {
    Reply::Error("ERR value is not an integer or out of range".to_string())
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, command: Command) -> Result<Reply> {
        self.check_open()?;
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(self.execute(&command).await)
    }

    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.check_open()?;
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            replies.push(self.execute(command).await);
        }
        Ok(replies)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("entry_count", &self.cache.entry_count())
            .field("exchanges", &self.exchanges())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn key() -> Key {
        Key::new("k")
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let mut conn = MemoryConnection::new();

        assert_eq!(
            conn.send(Command::set(&key(), Bytes::from("v"))).await.unwrap(),
            Reply::ok()
        );
        assert_eq!(
            conn.send(Command::get(&key())).await.unwrap(),
            Reply::Bulk(Some(Bytes::from("v")))
        );
        assert_eq!(conn.send(Command::del(&key())).await.unwrap(), Reply::Integer(1));
        assert_eq!(conn.send(Command::del(&key())).await.unwrap(), Reply::Integer(0));
        assert_eq!(conn.send(Command::get(&key())).await.unwrap(), Reply::nil());
    }

    #[tokio::test]
    async fn test_strlen_and_exists() {
        let mut conn = MemoryConnection::new();
        assert_eq!(conn.send(Command::strlen(&key())).await.unwrap(), Reply::Integer(0));
        assert_eq!(conn.send(Command::exists(&key())).await.unwrap(), Reply::Integer(0));

        conn.send(Command::set(&key(), Bytes::from("four"))).await.unwrap();
        assert_eq!(conn.send(Command::strlen(&key())).await.unwrap(), Reply::Integer(4));
        assert_eq!(conn.send(Command::exists(&key())).await.unwrap(), Reply::Integer(1));
    }

    #[tokio::test]
    async fn test_expire_missing_key_returns_zero() {
        let mut conn = MemoryConnection::new();
        let reply = conn
            .send(Command::expire(&key(), Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let mut conn = MemoryConnection::new();
        conn.pipeline(vec![
            Command::set(&key(), Bytes::from("v")),
            Command::expire(&key(), Duration::from_millis(100)),
        ])
        .await
        .unwrap();

        let Reply::Integer(pttl) = conn.send(Command::new("PTTL").arg(key().to_string())).await.unwrap() else {
            panic!("PTTL should answer with an integer");
        };
        assert!(pttl > 0 && pttl <= 100);

        sleep(Duration::from_millis(250)).await;
        assert_eq!(conn.send(Command::exists(&key())).await.unwrap(), Reply::Integer(0));
    }

    #[tokio::test]
    async fn test_set_clears_previous_ttl() {
        let mut conn = MemoryConnection::new();
        conn.pipeline(vec![
            Command::set(&key(), Bytes::from("v")),
            Command::expire(&key(), Duration::from_secs(10)),
        ])
        .await
        .unwrap();
        conn.send(Command::set(&key(), Bytes::from("w"))).await.unwrap();

        assert_eq!(conn.remaining_ttl(&key()).await, Some(None));
        let reply = conn.send(Command::new("PTTL").arg(key().to_string())).await.unwrap();
        assert_eq!(reply, Reply::Integer(-1));
    }

    #[tokio::test]
    async fn test_non_positive_expire_deletes() {
        let mut conn = MemoryConnection::new();
        conn.send(Command::set(&key(), Bytes::from("v"))).await.unwrap();
        let reply = conn
            .send(Command::new("EXPIRE").arg(key().to_string()).arg("0"))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Integer(1));
        assert_eq!(conn.remaining_ttl(&key()).await, None);
    }

    #[tokio::test]
    async fn test_unrepresentable_expire_is_rejected() {
        let mut conn = MemoryConnection::new();
        conn.send(Command::set(&key(), Bytes::from("v"))).await.unwrap();

        let reply = conn
            .send(Command::expire(&key(), Duration::from_secs(i64::MAX as u64)))
            .await
            .unwrap();
        assert_eq!(
            reply.error_message(),
            Some("ERR invalid expire time in 'expire' command")
        );
        // the key keeps its previous state
        assert_eq!(conn.remaining_ttl(&key()).await, Some(None));
    }

    #[tokio::test]
    async fn test_flushall() {
        let mut conn = MemoryConnection::new();
        conn.send(Command::set(&key(), Bytes::from("v"))).await.unwrap();
        conn.send(Command::flushall()).await.unwrap();
        assert_eq!(conn.send(Command::get(&key())).await.unwrap(), Reply::nil());
    }

    #[tokio::test]
    async fn test_bad_commands() {
        let mut conn = MemoryConnection::new();
        let reply = conn.send(Command::new("GET")).await.unwrap();
        assert_eq!(
            reply.error_message(),
            Some("ERR wrong number of arguments for 'get' command")
        );
        let reply = conn.send(Command::new("HGETALL").arg("x")).await.unwrap();
        assert_eq!(reply.error_message(), Some("ERR unknown command 'HGETALL'"));
        let reply = conn
            .send(Command::new("EXPIRE").arg("x").arg("soon"))
            .await
            .unwrap();
        assert!(reply.error_message().unwrap().contains("not an integer"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let mut conn = MemoryConnection::new();
        conn.fail_command("set", "READONLY replica");
        let reply = conn.send(Command::set(&key(), Bytes::from("v"))).await.unwrap();
        assert_eq!(reply.error_message(), Some("READONLY replica"));

        conn.clear_fault("SET");
        let reply = conn.send(Command::set(&key(), Bytes::from("v"))).await.unwrap();
        assert_eq!(reply, Reply::ok());
    }

    #[tokio::test]
    async fn test_pipeline_counts_as_one_exchange() {
        let mut conn = MemoryConnection::new();
        let replies = conn
            .pipeline(vec![
                Command::set(&key(), Bytes::from("v")),
                Command::strlen(&key()),
                Command::ping(),
            ])
            .await
            .unwrap();
        assert_eq!(
            replies,
            vec![Reply::ok(), Reply::Integer(1), Reply::Status("PONG".into())]
        );
        assert_eq!(conn.exchanges(), 1);
        assert!(conn.pipeline(Vec::new()).await.unwrap().is_empty());
        assert_eq!(conn.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_work() {
        let mut conn = MemoryConnection::new();
        conn.close().await.unwrap();
        assert!(conn.send(Command::ping()).await.is_err());
        assert!(conn.pipeline(vec![Command::ping()]).await.is_err());
    }
}
