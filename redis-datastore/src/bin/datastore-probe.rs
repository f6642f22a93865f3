use bytes::Bytes;
use datastore::{Datastore, Key};
use redis_datastore::RedisDatastore;
use shared::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Walks one key through the whole datastore surface against a live server.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Config::from_env();
    let key = Key::new(std::env::args().nth(1).unwrap_or_else(|| "datastore-probe".to_string()));

    info!("Connecting to {} (ttl: {:?})", config.address(), config.ttl());
    let store = RedisDatastore::connect(&config).await?;

    store.put(&key, Bytes::from_static(b"probe").into()).await?;
    let value = store.get(&key).await?;
    let size = store.get_size(&key).await?;
    info!("{key} holds {size} bytes: {:?}", value);

    let present = store.has(&key).await?;
    store.delete(&key).await?;
    let still_present = store.has(&key).await?;
    info!("{key} present before delete: {present}, after: {still_present}");

    store.close().await?;
    info!("Probe finished");
    Ok(())
}
