use redis::Client;
use redis::aio::ConnectionManager;

/// Connect to Redis and make sure the server answers before handing the
/// manager out. The manager reconnects on its own after later outages.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    if pong != "PONG" {
        anyhow::bail!("unexpected PING reply from Redis: {}", pong);
    }

    tracing::info!("Connected to Redis");
    Ok(manager)
}
