use crate::command::{Command, Reply};
use crate::domain::{Key, Query, QueryResults, Value};
use async_trait::async_trait;
use bytes::Bytes;
use shared::Result;

// Ports are the seams between callers, store adapters and the wire client

/// Generic key-value store interface exposed to callers
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn put(&self, key: &Key, value: Value) -> Result<()>;
    async fn get(&self, key: &Key) -> Result<Bytes>;
    async fn get_size(&self, key: &Key) -> Result<usize>;
    async fn has(&self, key: &Key) -> Result<bool>;
    async fn delete(&self, key: &Key) -> Result<()>;
    /// Flush anything buffered under `prefix` to the system of record.
    async fn sync(&self, prefix: &Key) -> Result<()>;
    async fn query(&self, query: Query) -> Result<QueryResults>;
    async fn close(&self) -> Result<()>;
}

/// A group of writes committed together
#[async_trait]
pub trait Batch: Send {
    async fn put(&mut self, key: Key, value: Value) -> Result<()>;
    async fn delete(&mut self, key: Key) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Batching: Datastore {
    async fn batch(&self) -> Result<Box<dyn Batch>>;
}

/// Port for the network client talking to the remote cache.
/// Implementations are not required to be safe for interleaved use;
/// adapters serialize access themselves.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Single request/response round-trip.
    async fn send(&mut self, command: Command) -> Result<Reply>;

    /// Writes every command before reading any reply, then returns the
    /// replies in issue order.
    async fn pipeline(&mut self, commands: Vec<Command>) -> Result<Vec<Reply>>;

    async fn close(&mut self) -> Result<()>;
}
