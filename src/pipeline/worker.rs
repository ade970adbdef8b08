//! The build worker: a long-lived consumer of the build queue.
//!
//! Each job is processed in its own task so a panic in a build step is
//! contained and the job can be dead-lettered instead of lost.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::QueueBridge;
use super::build::BuildStep;
use super::models::{DeploymentId, DeploymentStatus, Direction, TransferReport};
use super::storage::BlobStore;
use super::transfer::{BlobLister, TransferPool};
use crate::config::WorkerConfig;
use crate::errors::BuildError;

/// Delay before polling again after the queue reported an error.
pub const POLL_BACKOFF: Duration = Duration::from_secs(1);

pub struct BuildWorker {
    bridge: QueueBridge,
    blobs: Arc<dyn BlobStore>,
    pool: TransferPool,
    workdir: PathBuf,
    step: Option<Arc<dyn BuildStep>>,
    poll_backoff: Duration,
}

impl BuildWorker {
    pub fn new(
        bridge: QueueBridge,
        blobs: Arc<dyn BlobStore>,
        pool: TransferPool,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            bridge,
            blobs,
            pool,
            workdir: config.workdir.clone(),
            step: None,
            poll_backoff: POLL_BACKOFF,
        }
    }

    pub fn with_step(mut self, step: Arc<dyn BuildStep>) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Poll, download, repeat until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            queue = self.bridge.build_queue(),
            dead_letter = self.bridge.dead_letter_queue(),
            transfer_workers = self.pool.workers(),
            step = self.step.as_ref().map(|s| s.name()).unwrap_or("none"),
            "build worker started"
        );
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.bridge.next_build() => polled,
            };
            let payload = match polled {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, "failed to poll build queue");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_backoff) => continue,
                    }
                }
            };
            self.dispatch(payload, &cancel).await;
        }
        info!("build worker stopped");
    }

    /// Process one job in its own task and route failures.
    async fn dispatch(self: &Arc<Self>, payload: String, cancel: &CancellationToken) {
        debug!(payload, "build job received");
        let worker = Arc::clone(self);
        let job = payload.clone();
        let token = cancel.clone();
        let joined = tokio::spawn(async move { worker.process(&job, &token).await }).await;

        let mut requeue = false;
        let dead_letter = match joined {
            Ok(Ok(report)) => {
                info!(
                    deployment = %payload,
                    files = report.transferred,
                    failed = report.failed.len(),
                    bytes = report.bytes,
                    "build job finished"
                );
                false
            }
            Ok(Err(e @ (BuildError::InvalidJob { .. } | BuildError::Download { .. }))) => {
                error!(deployment = %payload, error = %e, "build job failed");
                true
            }
            Ok(Err(BuildError::Cancelled { .. })) => {
                info!(deployment = %payload, "build job interrupted by shutdown");
                requeue = true;
                false
            }
            Ok(Err(e)) => {
                error!(deployment = %payload, error = %e, "build job failed");
                false
            }
            Err(e) if e.is_panic() => {
                error!(deployment = %payload, "build job panicked");
                true
            }
            Err(e) => {
                warn!(deployment = %payload, error = %e, "build job task cancelled");
                false
            }
        };

        if dead_letter {
            if let Err(e) = self.bridge.dead_letter(&payload).await {
                error!(deployment = %payload, error = %e, "failed to dead-letter build job");
            }
        }
        if requeue {
            if let Err(e) = self.bridge.requeue_build(&payload).await {
                error!(deployment = %payload, error = %e, "failed to requeue interrupted build job");
            }
        }
    }

    /// Download the source tree of one job and run the build step, if any.
    ///
    /// A listing failure or a cancelled download leaves the status untouched.
    pub async fn process(
        &self,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, BuildError> {
        let id = DeploymentId::parse(payload).ok_or_else(|| BuildError::InvalidJob {
            payload: payload.to_string(),
        })?;

        let lister = BlobLister::new(Arc::clone(&self.blobs), id.source_prefix(), &self.workdir);
        let report = self
            .pool
            .run(Direction::Download, &lister, cancel)
            .await
            .map_err(|source| BuildError::Download {
                id: id.to_string(),
                source,
            })?;
        if report.cancelled {
            return Err(BuildError::Cancelled { id: id.to_string() });
        }

        if let Some(step) = &self.step {
            self.run_step(step.as_ref(), &id, &report, cancel).await?;
        }
        Ok(report)
    }

    async fn run_step(
        &self,
        step: &dyn BuildStep,
        id: &DeploymentId,
        download: &TransferReport,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        self.bridge.set_status(id, DeploymentStatus::Building).await?;

        let result = if !download.is_complete() {
            Err(BuildError::Step {
                id: id.to_string(),
                message: format!(
                    "download incomplete: {} of {} objects failed",
                    download.failed.len(),
                    download.attempted
                ),
            })
        } else {
            step.run(id, &self.workdir.join(id.as_str()), cancel).await
        };

        match result {
            Ok(()) => {
                self.bridge.set_status(id, DeploymentStatus::Ready).await?;
                info!(deployment = %id, step = step.name(), "deployment ready");
                Ok(())
            }
            Err(e @ BuildError::Cancelled { .. }) => {
                // The job goes back on the queue, so the deployment is not failed.
                self.bridge.set_status(id, DeploymentStatus::Uploaded).await?;
                Err(e)
            }
            Err(e) => {
                self.bridge.set_status(id, DeploymentStatus::Failed).await?;
                Err(e)
            }
        }
    }
}
