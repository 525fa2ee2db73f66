//! Process-wide broker connection.
//!
//! The first caller creates the connection; everyone after that gets a clone of
//! the same multiplexed `ConnectionManager`. Concurrent first calls race on a
//! `OnceCell`, so exactly one connection is ever established. There is no
//! teardown: the connection lives as long as the process.
//!
//! The manager reconnects on its own after transient failures. Because it is
//! multiplexed, callers must not issue blocking commands (BLPOP, BLMOVE) on it.

use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::info;

static BROKER: OnceCell<ConnectionManager> = OnceCell::const_new();

/// Get the shared broker connection, connecting on first use.
///
/// Only the config passed on the very first call is used.
pub async fn shared(config: &BrokerConfig) -> BrokerResult<ConnectionManager> {
    let conn = BROKER
        .get_or_try_init(|| async {
            let client = redis::Client::open(config.redis_url.as_str())?;
            let conn = ConnectionManager::new(client).await?;
            info!(redis_url = %config.redis_url, "Connected to broker");
            Ok::<_, redis::RedisError>(conn)
        })
        .await?;

    Ok(conn.clone())
}
