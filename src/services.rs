//! Builds the pipeline components from a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, QueueBackend};
use crate::pipeline::api::{AppState, SharedState};
use crate::pipeline::bridge::{QueueBridge, RedisBackend};
use crate::pipeline::build::PublishStep;
use crate::pipeline::intake::IntakeCoordinator;
use crate::pipeline::router::{RouterState, SharedRouterState};
use crate::pipeline::source::GitCloner;
use crate::pipeline::storage::{BlobStore, ObjectStoreBlobs};
use crate::pipeline::transfer::TransferPool;
use crate::pipeline::worker::BuildWorker;

/// Shared adapters. One instance per process; every component built from
/// it talks to the same blob store and queue.
#[derive(Clone)]
pub struct Services {
    pub config: Config,
    pub blobs: Arc<dyn BlobStore>,
    pub bridge: QueueBridge,
    pub pool: TransferPool,
}

impl Services {
    pub async fn connect(config: Config) -> Result<Self> {
        let blobs: Arc<dyn BlobStore> = Arc::new(
            ObjectStoreBlobs::from_config(&config.storage)
                .context("Failed to initialise blob store")?,
        );
        info!(backend = %config.storage.backend, path = %config.storage.path, "blob store ready");

        let bridge = match config.queue.backend {
            QueueBackend::Redis => {
                let backend = Arc::new(
                    RedisBackend::connect(&config.queue.url)
                        .await
                        .context("Failed to connect to the queue")?,
                );
                QueueBridge::new(backend.clone(), backend, &config.queue)
            }
            QueueBackend::Memory => {
                warn!("using the in-memory queue; jobs are not shared between processes");
                QueueBridge::in_memory(&config.queue)
            }
        };

        Ok(Self::with_adapters(config, blobs, bridge))
    }

    pub fn with_adapters(config: Config, blobs: Arc<dyn BlobStore>, bridge: QueueBridge) -> Self {
        let pool = TransferPool::new(Arc::clone(&blobs), &config.transfer);
        Self {
            config,
            blobs,
            bridge,
            pool,
        }
    }

    pub fn intake(&self) -> IntakeCoordinator {
        IntakeCoordinator::new(
            Arc::new(GitCloner::new(self.config.intake.shallow)),
            self.pool.clone(),
            self.bridge.clone(),
            &self.config.intake,
        )
    }

    pub fn intake_state(&self, shutdown: CancellationToken) -> SharedState {
        Arc::new(AppState {
            intake: self.intake(),
            bridge: self.bridge.clone(),
            shutdown,
        })
    }

    pub fn router_state(&self) -> SharedRouterState {
        Arc::new(RouterState::new(Arc::clone(&self.blobs), &self.config.router))
    }

    pub fn build_worker(&self) -> BuildWorker {
        let worker = BuildWorker::new(
            self.bridge.clone(),
            Arc::clone(&self.blobs),
            self.pool.clone(),
            &self.config.worker,
        );
        if self.config.worker.publish {
            worker.with_step(Arc::new(PublishStep::new(
                self.pool.clone(),
                self.config.router.base_prefix.clone(),
                self.config.worker.publish_dir.clone(),
            )))
        } else {
            worker
        }
    }
}
