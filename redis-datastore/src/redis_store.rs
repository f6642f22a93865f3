use async_trait::async_trait;
use bytes::Bytes;
use datastore::{
    Batch, Batching, Command, Connection, Datastore, Key, Query, QueryResults, Reply, Value,
};
use resp_client::RespConnection;
use shared::config::Config;
use shared::{Error, Result};
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const PUT_CONTEXT: &str = "failed to put value";
const GET_CONTEXT: &str = "failed to get value";
const SIZE_CONTEXT: &str = "failed to get value size";
const HAS_CONTEXT: &str = "failed to check existence";
const DELETE_CONTEXT: &str = "failed to delete value";

/// Datastore backed by a remote cache connection.
///
/// One mutex guards the connection for the whole of every operation, so the
/// `SET`/`EXPIRE` pair of a TTL put is never interleaved with another
/// operation's commands. Operations take no deadline; a future dropped
/// mid-exchange leaves the underlying connection in an unknown state.
pub struct RedisDatastore<C: Connection> {
    conn: Mutex<Option<C>>,
    ttl: Option<Duration>,
}

impl<C: Connection> RedisDatastore<C> {
    /// Datastore whose entries never expire
    pub fn new(conn: C) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            ttl: None,
        }
    }

    /// Datastore that gives every written entry `ttl`. A zero TTL means no expiration.
    pub fn with_ttl(conn: C, ttl: Duration) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    async fn send(&self, command: Command, context: &'static str) -> Result<Reply> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.send(command)
            .await
            .map_err(|e| Error::transport(context, e))
    }

    async fn put_bytes(&self, key: &Key, value: Bytes) -> Result<()> {
        let set = Command::set(key, value);

        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;

        let Some(ttl) = self.ttl else {
            debug!(key = %key, "SET");
            conn.send(set)
                .await
                .map_err(|e| Error::transport(PUT_CONTEXT, e))?
                .into_result(PUT_CONTEXT)?;
            return Ok(());
        };

        debug!(key = %key, ttl = ?ttl, "SET + EXPIRE");
        let mut replies = conn
            .pipeline(vec![set, Command::expire(key, ttl)])
            .await
            .map_err(|e| Error::transport(PUT_CONTEXT, e))?
            .into_iter();

        replies
            .next()
            .ok_or_else(|| Error::transport(PUT_CONTEXT, "no reply to SET"))?
            .into_result(PUT_CONTEXT)?;

        // From here on the value is stored; any failure means it has no TTL
        let expiration_failed = |reason: String| Error::Expiration {
            key: key.to_string(),
            reason,
        };
        match replies.next() {
            Some(Reply::Error(reason)) => Err(expiration_failed(reason)),
            Some(Reply::Integer(0)) => Err(expiration_failed(
                "key was gone before its expiration could be set".to_string(),
            )),
            Some(_) => Ok(()),
            None => Err(expiration_failed("no reply to EXPIRE".to_string())),
        }
    }
}

impl RedisDatastore<RespConnection> {
    /// Connects over TCP using `config`, applying its TTL to every write.
    pub async fn connect(config: &Config) -> Result<Self> {
        let conn = RespConnection::connect_with(config).await?;
        Ok(match config.ttl() {
            Some(ttl) => Self::with_ttl(conn, ttl),
            None => Self::new(conn),
        })
    }
}

fn closed() -> Error {
    Error::transport("connection closed", "datastore has been closed")
}

fn report<T>(op: &str, key: &Key, result: Result<T>) -> Result<T> {
    match &result {
        Err(Error::NotFound) => debug!(key = %key, "{} found nothing", op),
        Err(e) => warn!(key = %key, "{} failed: {}", op, e),
        Ok(_) => {}
    }
    result
}

#[async_trait]
impl<C: Connection> Datastore for RedisDatastore<C> {
    async fn put(&self, key: &Key, value: Value) -> Result<()> {
        // reject before anything reaches the wire
        let value = report("put", key, value.into_bytes())?;
        report("put", key, self.put_bytes(key, value).await)
    }

    async fn get(&self, key: &Key) -> Result<Bytes> {
        let result = async {
            self.send(Command::get(key), GET_CONTEXT)
                .await?
                .into_bytes(GET_CONTEXT)
        }
        .await;
        report("get", key, result)
    }

    /// Length of the stored value. Absent keys report 0, as the cache does.
    async fn get_size(&self, key: &Key) -> Result<usize> {
        let result = async {
            let len = self
                .send(Command::strlen(key), SIZE_CONTEXT)
                .await?
                .into_integer(SIZE_CONTEXT)?;
            usize::try_from(len)
                .map_err(|_| Error::Protocol(format!("{SIZE_CONTEXT}: negative length {len}")))
        }
        .await;
        report("get_size", key, result)
    }

    async fn has(&self, key: &Key) -> Result<bool> {
        let result = async {
            self.send(Command::exists(key), HAS_CONTEXT)
                .await?
                .into_bool(HAS_CONTEXT)
        }
        .await;
        report("has", key, result)
    }

    /// Deleting an absent key succeeds.
    async fn delete(&self, key: &Key) -> Result<()> {
        let result = async {
            self.send(Command::del(key), DELETE_CONTEXT)
                .await?
                .into_integer(DELETE_CONTEXT)
                .map(|_| ())
        }
        .await;
        report("delete", key, result)
    }

    async fn sync(&self, _prefix: &Key) -> Result<()> {
        // Nothing is buffered locally
        Ok(())
    }

    async fn query(&self, _query: Query) -> Result<QueryResults> {
        Err(Error::Unsupported("query"))
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        match conn {
            Some(mut conn) => {
                debug!("Closing datastore connection");
                conn.close()
                    .await
                    .map_err(|e| Error::transport("failed to close connection", e))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<C: Connection> Batching for RedisDatastore<C> {
    async fn batch(&self) -> Result<Box<dyn Batch>> {
        Err(Error::Unsupported("batch"))
    }
}

impl<C: Connection> Debug for RedisDatastore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDatastore")
            .field("ttl", &self.ttl)
            .field("conn", &"<connection>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use shared::ErrorKind;

    fn key() -> Key {
        Key::new("foo")
    }

    #[tokio::test]
    async fn test_put_without_ttl_is_one_exchange() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::new(conn.clone());

        ds.put(&key(), Value::from(b"bar")).await.unwrap();

        assert_eq!(conn.exchanges(), 1);
        assert_eq!(conn.remaining_ttl(&key()).await, Some(None));
    }

    #[tokio::test]
    async fn test_put_with_ttl_pipelines_set_and_expire() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::from_secs(60));

        ds.put(&key(), Value::from(b"bar")).await.unwrap();

        // both commands travel in a single exchange
        assert_eq!(conn.exchanges(), 1);
        let remaining = conn.remaining_ttl(&key()).await.unwrap().unwrap();
        assert!(remaining > Duration::from_secs(58) && remaining <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_zero_ttl_means_no_expiration() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::ZERO);
        assert_eq!(ds.ttl(), None);

        ds.put(&key(), Value::from(b"bar")).await.unwrap();
        assert_eq!(conn.remaining_ttl(&key()).await, Some(None));
    }

    #[tokio::test]
    async fn test_invalid_value_type_sends_nothing() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::from_secs(5));

        for value in [Value::from("bar"), Value::from(7i64), Value::from(false)] {
            let err = ds.put(&key(), value).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidValueType);
        }
        assert_eq!(conn.exchanges(), 0);
        assert!(!ds.has(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_set_reports_put_failure() {
        let conn = MemoryConnection::new();
        conn.fail_command("SET", "OOM command not allowed");
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::from_secs(5));

        let err = ds.put(&key(), Value::from(b"bar")).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to put value: OOM command not allowed");
        assert!(!err.value_may_lack_ttl());
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_is_an_expiration_fault() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::from_secs(i64::MAX as u64));

        let err = ds.put(&key(), Value::from(b"bar")).await.unwrap_err();
        assert!(err.value_may_lack_ttl());
        assert!(err.to_string().contains("ERR invalid expire time"));
        assert_eq!(conn.remaining_ttl(&key()).await, Some(None));
    }

    #[tokio::test]
    async fn test_failed_expire_reports_partial_write() {
        let conn = MemoryConnection::new();
        conn.fail_command("EXPIRE", "ERR expire disabled");
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::from_secs(5));

        let err = ds.put(&key(), Value::from(b"bar")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.value_may_lack_ttl());
        assert_eq!(
            err.to_string(),
            "failed to set expiration for /foo: ERR expire disabled (value was stored without a TTL)"
        );

        // the write itself went through, without an expiration
        assert_eq!(ds.get(&key()).await.unwrap(), Bytes::from_static(b"bar"));
        assert_eq!(conn.remaining_ttl(&key()).await, Some(None));
    }

    #[tokio::test]
    async fn test_sub_second_ttl_uses_millisecond_expiry() {
        let conn = MemoryConnection::new();
        conn.fail_command("EXPIRE", "ERR should not be used");
        let ds = RedisDatastore::with_ttl(conn.clone(), Duration::from_millis(1500));

        ds.put(&key(), Value::from(b"bar")).await.unwrap();
        let remaining = conn.remaining_ttl(&key()).await.unwrap().unwrap();
        assert!(remaining <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let ds = RedisDatastore::new(MemoryConnection::new());
        let err = ds.get(&key()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_error_reply_is_transport_fault() {
        let conn = MemoryConnection::new();
        conn.fail_command("GET", "WRONGTYPE Operation against a key holding the wrong kind of value");
        let ds = RedisDatastore::new(conn);

        let err = ds.get(&key()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().starts_with("failed to get value: WRONGTYPE"));
    }

    #[tokio::test]
    async fn test_get_size_of_missing_key_is_zero() {
        let ds = RedisDatastore::new(MemoryConnection::new());
        assert_eq!(ds.get_size(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_operations_touch_nothing() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::new(conn.clone());

        let err = ds.query(Query::with_prefix("/")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = ds.batch().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        ds.sync(&Key::root()).await.unwrap();

        assert_eq!(conn.exchanges(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let conn = MemoryConnection::new();
        let ds = RedisDatastore::new(conn.clone());

        ds.close().await.unwrap();
        assert!(conn.is_closed());

        let err = ds.has(&key()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().starts_with("connection closed"));

        // second close is a no-op
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_fault_is_wrapped() {
        let mut conn = MemoryConnection::new();
        conn.close().await.unwrap();
        let ds = RedisDatastore::new(conn);

        let err = ds.delete(&key()).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to delete value: "));
    }
}
