//! Redis-backed work queue and status store.
//!
//! Lists carry the queues (LPUSH / BRPOP), one hash per deployment id
//! carries the status record (HSET / HGET).

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{StatusStore, WorkQueue};
use crate::errors::BridgeError;

pub struct RedisBackend {
    client: redis::Client,
    commands: ConnectionManager,
    // BRPOP parks its connection, so blocking pops never share `commands`.
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = redis::Client::open(url)
            .map_err(|e| BridgeError::QueueUnavailable(format!("invalid redis url {url}: {e}")))?;
        let commands = client
            .get_connection_manager()
            .await
            .map_err(|e| BridgeError::QueueUnavailable(format!("failed to connect to {url}: {e}")))?;
        info!(url, "connected to redis");
        Ok(Self {
            client,
            commands,
            blocking: Mutex::new(None),
        })
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, BridgeError> {
        let mut slot = self.blocking.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BridgeError::QueueUnavailable(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_blocking_connection(&self) {
        self.blocking.lock().await.take();
    }
}

/// Empties the connection slot on drop unless the pop completed.
struct InFlightPop<'a, C> {
    slot: &'a Mutex<Option<C>>,
    armed: bool,
}

impl<'a, C> InFlightPop<'a, C> {
    fn arm(slot: &'a Mutex<Option<C>>) -> Self {
        Self { slot, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C> Drop for InFlightPop<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The slot lock is only held to clone or replace the handle.
        match self.slot.try_lock() {
            Ok(mut slot) => {
                slot.take();
            }
            Err(_) => warn!("could not discard blocking redis connection after an abandoned pop"),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisBackend {
    async fn push(&self, queue: &str, value: &str) -> Result<(), BridgeError> {
        let mut conn = self.commands.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(queue)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| BridgeError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Dropping this future mid-wait discards the blocking connection, which
    /// makes the server abandon the pending BRPOP. A push that lands in the
    /// short gap before the socket closes is still lost.
    async fn blocking_pop(&self, queue: &str) -> Result<String, BridgeError> {
        let mut conn = self.blocking_connection().await?;
        let mut guard = InFlightPop::arm(&self.blocking);
        loop {
            let popped: Option<(String, String)> = match redis::cmd("BRPOP")
                .arg(queue)
                .arg(0)
                .query_async(&mut conn)
                .await
            {
                Ok(popped) => popped,
                Err(e) => {
                    self.drop_blocking_connection().await;
                    return Err(BridgeError::QueueUnavailable(e.to_string()));
                }
            };
            match popped {
                Some((_, value)) => {
                    guard.disarm();
                    return Ok(value);
                }
                // Only reachable if the server times the call out anyway.
                None => debug!(queue, "BRPOP returned nil, waiting again"),
            }
        }
    }
}

#[async_trait]
impl StatusStore for RedisBackend {
    async fn set_field(&self, id: &str, field: &str, value: &str) -> Result<(), BridgeError> {
        let mut conn = self.commands.clone();
        let _: i64 = redis::cmd("HSET")
            .arg(id)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| BridgeError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_field(&self, id: &str, field: &str) -> Result<Option<String>, BridgeError> {
        let mut conn = self.commands.clone();
        redis::cmd("HGET")
            .arg(id)
            .arg(field)
            .query_async(&mut conn)
            .await
            .map_err(|e| BridgeError::StoreUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("GITBIT_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let err = RedisBackend::connect("not a url").await.err().unwrap();
        assert!(matches!(err, BridgeError::QueueUnavailable(_)));
    }

    #[test]
    fn test_abandoned_pop_empties_connection_slot() {
        let slot = Mutex::new(Some(7u32));
        drop(InFlightPop::arm(&slot));
        assert!(slot.try_lock().unwrap().is_none());
    }

    #[test]
    fn test_completed_pop_keeps_connection() {
        let slot = Mutex::new(Some(7u32));
        let mut guard = InFlightPop::arm(&slot);
        guard.disarm();
        drop(guard);
        assert_eq!(*slot.try_lock().unwrap(), Some(7));
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_abandoned_pop_does_not_swallow_next_push() {
        let backend = RedisBackend::connect(&redis_url()).await.unwrap();
        let queue = format!("gitbit-test-{}", uuid::Uuid::new_v4().simple());
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(100), backend.blocking_pop(&queue))
                .await;
        assert!(waited.is_err());
        // Give the dropped connection time to close server-side.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        backend.push(&queue, "kept").await.unwrap();
        assert_eq!(backend.blocking_pop(&queue).await.unwrap(), "kept");
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_push_pop_against_server() {
        let backend = RedisBackend::connect(&redis_url()).await.unwrap();
        let queue = format!("gitbit-test-{}", uuid::Uuid::new_v4().simple());
        backend.push(&queue, "first").await.unwrap();
        backend.push(&queue, "second").await.unwrap();
        assert_eq!(backend.blocking_pop(&queue).await.unwrap(), "first");
        assert_eq!(backend.blocking_pop(&queue).await.unwrap(), "second");
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn test_hash_fields_against_server() {
        let backend = RedisBackend::connect(&redis_url()).await.unwrap();
        let id = format!("gitbit-test-{}", uuid::Uuid::new_v4().simple());
        assert_eq!(backend.get_field(&id, "status").await.unwrap(), None);
        backend.set_field(&id, "status", "uploaded").await.unwrap();
        assert_eq!(
            backend.get_field(&id, "status").await.unwrap().as_deref(),
            Some("uploaded")
        );
    }
}
