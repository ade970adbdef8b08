//! Queue/status bridge: the only seam between the pipeline and the durable
//! work queue and key-value store.
//!
//! Backends implement the raw capabilities ([`WorkQueue`], [`StatusStore`]);
//! [`QueueBridge`] layers the pipeline vocabulary on top of them.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::models::{DeploymentId, DeploymentStatus};
use crate::config::QueueConfig;
use crate::errors::BridgeError;

pub use memory::{MemoryQueue, MemoryStatusStore};
pub use self::redis::RedisBackend;

/// Field of the per-deployment record holding the lifecycle label.
pub const STATUS_FIELD: &str = "status";

/// Named FIFO lists. `push` adds at the head, `blocking_pop` takes from the
/// tail and waits indefinitely for an item.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, queue: &str, value: &str) -> Result<(), BridgeError>;

    async fn blocking_pop(&self, queue: &str) -> Result<String, BridgeError>;
}

/// One record of string fields per id.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set_field(&self, id: &str, field: &str, value: &str) -> Result<(), BridgeError>;

    /// `Ok(None)` when the record or the field does not exist.
    async fn get_field(&self, id: &str, field: &str) -> Result<Option<String>, BridgeError>;
}

#[derive(Clone)]
pub struct QueueBridge {
    queue: Arc<dyn WorkQueue>,
    status: Arc<dyn StatusStore>,
    build_queue: String,
    dead_letter_queue: String,
}

impl QueueBridge {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        status: Arc<dyn StatusStore>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            status,
            build_queue: config.build_queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
        }
    }

    /// Bridge over a fresh in-memory queue and status store.
    pub fn in_memory(config: &QueueConfig) -> Self {
        Self::new(
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryStatusStore::new()),
            config,
        )
    }

    pub fn build_queue(&self) -> &str {
        &self.build_queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    /// Push `id` onto the build queue. Pushing the same id twice yields two jobs.
    pub async fn enqueue_build(&self, id: &DeploymentId) -> Result<(), BridgeError> {
        self.queue.push(&self.build_queue, id.as_str()).await?;
        debug!(deployment = %id, queue = %self.build_queue, "build enqueued");
        Ok(())
    }

    /// Put a job that was taken but not finished back on the build queue.
    pub async fn requeue_build(&self, payload: &str) -> Result<(), BridgeError> {
        self.queue.push(&self.build_queue, payload).await?;
        debug!(payload, queue = %self.build_queue, "build requeued");
        Ok(())
    }

    /// Block until a build job is available and return its raw payload.
    pub async fn next_build(&self) -> Result<String, BridgeError> {
        self.queue.blocking_pop(&self.build_queue).await
    }

    pub async fn dead_letter(&self, payload: &str) -> Result<(), BridgeError> {
        self.queue.push(&self.dead_letter_queue, payload).await?;
        warn!(payload, queue = %self.dead_letter_queue, "job moved to dead-letter queue");
        Ok(())
    }

    pub async fn set_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> Result<(), BridgeError> {
        self.status
            .set_field(id.as_str(), STATUS_FIELD, status.as_str())
            .await?;
        debug!(deployment = %id, status = %status, "status recorded");
        Ok(())
    }

    pub async fn get_status(&self, id: &DeploymentId) -> Result<DeploymentStatus, BridgeError> {
        let raw = self
            .status
            .get_field(id.as_str(), STATUS_FIELD)
            .await?
            .ok_or_else(|| BridgeError::StatusNotFound {
                id: id.to_string(),
            })?;
        raw.parse().map_err(|_| BridgeError::InvalidStatus {
            id: id.to_string(),
            value: raw,
        })
    }

    /// Whether any status record exists for `id`.
    pub async fn has_status(&self, id: &DeploymentId) -> Result<bool, BridgeError> {
        Ok(self
            .status
            .get_field(id.as_str(), STATUS_FIELD)
            .await?
            .is_some())
    }
}
