//! Post-download build steps.
//!
//! The worker runs at most one [`BuildStep`] per job, after the source tree
//! has been downloaded. [`PublishStep`] is the bundled one: it uploads the
//! tree under the prefix the static router serves from.

use std::path::{Component, Path};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::models::{DeploymentId, Direction};
use super::transfer::{FsLister, TransferPool};
use crate::errors::BuildError;

#[async_trait]
pub trait BuildStep: Send + Sync {
    fn name(&self) -> &str;

    /// Run against the downloaded tree of `id`, rooted at `tree`.
    async fn run(
        &self,
        id: &DeploymentId,
        tree: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError>;
}

pub struct PublishStep {
    pool: TransferPool,
    base_prefix: String,
    publish_dir: String,
}

impl PublishStep {
    pub fn new(
        pool: TransferPool,
        base_prefix: impl Into<String>,
        publish_dir: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            base_prefix: base_prefix.into(),
            publish_dir: publish_dir.into(),
        }
    }

    /// Key prefix the published files of `id` land under.
    pub fn publish_prefix(&self, id: &DeploymentId) -> String {
        let base = self.base_prefix.trim_matches('/');
        if base.is_empty() {
            format!("{id}/")
        } else {
            format!("{base}/{id}/")
        }
    }
}

/// Publish directories are relative and may not climb out of the tree.
pub fn is_safe_publish_dir(dir: &str) -> bool {
    Path::new(dir)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait]
impl BuildStep for PublishStep {
    fn name(&self) -> &str {
        "publish"
    }

    async fn run(
        &self,
        id: &DeploymentId,
        tree: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let step_err = |message: String| BuildError::Step {
            id: id.to_string(),
            message,
        };

        if !is_safe_publish_dir(&self.publish_dir) {
            return Err(step_err(format!(
                "publish directory '{}' leaves the deployment tree",
                self.publish_dir
            )));
        }
        let root = tree.join(&self.publish_dir);
        if !tokio::fs::metadata(&root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(step_err(format!("{} is not a directory", root.display())));
        }

        let prefix = self.publish_prefix(id);
        let report = self
            .pool
            .run(Direction::Upload, &FsLister::new(&root, prefix.clone()), cancel)
            .await
            .map_err(|e| step_err(e.to_string()))?;

        if report.cancelled {
            return Err(BuildError::Cancelled { id: id.to_string() });
        }
        if !report.failed.is_empty() {
            return Err(step_err(format!(
                "{} of {} files failed to publish",
                report.failed.len(),
                report.attempted
            )));
        }
        info!(deployment = %id, prefix, files = report.transferred, "deployment published");
        Ok(())
    }
}
