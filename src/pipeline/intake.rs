//! Deploy request handling: clone, upload, enqueue, record status.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::bridge::QueueBridge;
use super::models::{Deployment, DeploymentId, DeploymentReceipt, DeploymentStatus, Direction};
use super::source::{SourceFetcher, validate_source_url};
use super::transfer::{FsLister, TransferPool};
use crate::config::IntakeConfig;
use crate::errors::{IntakeError, TransferError};

pub struct IntakeCoordinator {
    fetcher: Arc<dyn SourceFetcher>,
    pool: TransferPool,
    bridge: QueueBridge,
    workdir: PathBuf,
    id_length: usize,
    id_attempts: u32,
}

impl IntakeCoordinator {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        pool: TransferPool,
        bridge: QueueBridge,
        config: &IntakeConfig,
    ) -> Self {
        Self {
            fetcher,
            pool,
            bridge,
            workdir: config.workdir.clone(),
            id_length: config.id_length,
            id_attempts: config.id_attempts.max(1),
        }
    }

    /// Run one deploy request to the point where a build job exists.
    ///
    /// Clone and enumeration failures are fatal and leave no queue entry and
    /// no status. Individual upload failures are logged and tolerated. The
    /// job is enqueued before the `uploaded` status is written.
    pub async fn submit(
        &self,
        source_url: &str,
        cancel: &CancellationToken,
    ) -> Result<DeploymentReceipt, IntakeError> {
        validate_source_url(source_url)?;

        let id = self.allocate_id().await?;
        let deployment = Deployment::new(id.clone(), source_url);
        info!(
            deployment = %deployment.id,
            source = %deployment.source_url,
            created_at = %deployment.created_at,
            "deployment accepted"
        );

        let clone_dir = self.workdir.join(id.as_str());
        self.fetcher.fetch_into(source_url, &clone_dir, cancel).await?;

        let lister = FsLister::new(&clone_dir, id.source_prefix());
        let report = self
            .pool
            .run(Direction::Upload, &lister, cancel)
            .await
            .map_err(|e| IntakeError::Enumerate {
                id: id.to_string(),
                message: match e {
                    TransferError::Listing(message) => message,
                    other => other.to_string(),
                },
            })?;
        if report.cancelled {
            return Err(IntakeError::Cancelled {
                url: source_url.to_string(),
            });
        }
        if !report.failed.is_empty() {
            warn!(
                deployment = %id,
                failed = report.failed.len(),
                uploaded = report.transferred,
                "some files were not uploaded"
            );
        }

        self.bridge.enqueue_build(&id).await?;
        self.bridge.set_status(&id, DeploymentStatus::Uploaded).await?;

        info!(
            deployment = %id,
            files = report.transferred,
            bytes = report.bytes,
            "deployment uploaded and queued"
        );
        Ok(DeploymentReceipt {
            id,
            status: DeploymentStatus::Uploaded,
        })
    }

    /// Draw ids until one has no status record and its working directory
    /// can be created. The directory is the reservation: `create_dir` fails
    /// for every request but one when two draw the same id.
    async fn allocate_id(&self) -> Result<DeploymentId, IntakeError> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .map_err(|source| IntakeError::Workdir {
                path: self.workdir.clone(),
                source,
            })?;
        for _ in 0..self.id_attempts {
            let id = DeploymentId::generate(self.id_length);
            if !self.bridge.has_status(&id).await? {
                let dir = self.workdir.join(id.as_str());
                match tokio::fs::create_dir(&dir).await {
                    Ok(()) => return Ok(id),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(source) => return Err(IntakeError::Workdir { path: dir, source }),
                }
            }
            warn!(deployment = %id, "generated id already in use, drawing another");
        }
        Err(IntakeError::IdExhausted {
            attempts: self.id_attempts,
        })
    }
}
