use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::messaging::BusTransport;

/// Redis-backed bus transport.
///
/// The connection is established lazily so the service starts (and keeps
/// ingesting) while the bus is unreachable; once established, the
/// `ConnectionManager` reconnects on its own.
pub struct RedisTransport {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisTransport {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| IngestError::Config(format!("invalid redis url: {e}")))?;
        info!(url, "redis publisher configured");
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn manager(&self) -> Result<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| IngestError::BusUnavailable(e.to_string()))?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

#[async_trait]
impl BusTransport for RedisTransport {
    async fn send(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self.manager().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| IngestError::BusUnavailable(e.to_string()))
    }
}
