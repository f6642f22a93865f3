//! Datastore adapter over a remote RESP cache.
//!
//! [`RedisDatastore`] maps the generic [`datastore::Datastore`] operations
//! onto cache commands, optionally giving every written key a TTL.
//! [`MemoryConnection`] emulates the cache in-process for tests and for
//! running without a server.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryConnection;
pub use redis_store::RedisDatastore;
