//! Fetching repository sources into a local working directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{FetchOptions, RemoteCallbacks};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::IntakeError;

const REMOTE_SCHEMES: &[&str] = &["http://", "https://", "git://", "ssh://"];

/// Reject URLs the cloner can never handle, before any side effect happens.
///
/// Accepts remote schemes, `file://` and absolute local paths.
pub fn validate_source_url(url: &str) -> Result<(), IntakeError> {
    let invalid = |message: &str| IntakeError::InvalidSource {
        url: url.to_string(),
        message: message.to_string(),
    };

    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(invalid("repository URL is empty"));
    }
    if trimmed != url {
        return Err(invalid("repository URL has surrounding whitespace"));
    }
    if let Some(scheme) = REMOTE_SCHEMES.iter().find(|s| url.starts_with(**s)) {
        if url.len() == scheme.len() {
            return Err(invalid("repository URL has no host"));
        }
        return Ok(());
    }
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(invalid("file URL has no path"));
        }
        return Ok(());
    }
    if Path::new(url).is_absolute() {
        return Ok(());
    }
    Err(invalid(
        "expected an http(s)://, git://, ssh://, file:// URL or an absolute path",
    ))
}

fn is_remote(url: &str) -> bool {
    REMOTE_SCHEMES.iter().any(|s| url.starts_with(s))
}

/// Materialises a repository working tree at a destination directory.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_into(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), IntakeError>;
}

/// `git2` clone of the default branch.
#[derive(Debug, Clone)]
pub struct GitCloner {
    shallow: bool,
}

impl GitCloner {
    pub fn new(shallow: bool) -> Self {
        Self { shallow }
    }
}

impl Default for GitCloner {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl SourceFetcher for GitCloner {
    async fn fetch_into(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), IntakeError> {
        let url_owned = url.to_string();
        let dest: PathBuf = dest.to_path_buf();
        let cancel = cancel.clone();
        // Local transports ignore depth, so only remote clones are shallow.
        let depth = (self.shallow && is_remote(url)).then_some(1);

        info!(url, dest = %dest.display(), "cloning repository");
        let result = tokio::task::spawn_blocking(move || {
            clone_blocking(&url_owned, &dest, depth, &cancel)
        })
        .await
        .map_err(|e| IntakeError::Clone {
            url: url.to_string(),
            message: format!("clone task failed: {e}"),
        })?;
        debug!(url, "clone finished");
        result
    }
}

fn clone_blocking(
    url: &str,
    dest: &Path,
    depth: Option<i32>,
    cancel: &CancellationToken,
) -> Result<(), IntakeError> {
    if cancel.is_cancelled() {
        return Err(IntakeError::Cancelled {
            url: url.to_string(),
        });
    }

    let mut callbacks = RemoteCallbacks::new();
    {
        let cancel = cancel.clone();
        // Returning false aborts the fetch with a user error.
        callbacks.transfer_progress(move |_| !cancel.is_cancelled());
    }

    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(callbacks);
    if let Some(depth) = depth {
        fetch.depth(depth);
    }

    match RepoBuilder::new().fetch_options(fetch).clone(url, dest) {
        Ok(_) => Ok(()),
        Err(_) if cancel.is_cancelled() => Err(IntakeError::Cancelled {
            url: url.to_string(),
        }),
        Err(e) => Err(IntakeError::Clone {
            url: url.to_string(),
            message: e.message().to_string(),
        }),
    }
}
