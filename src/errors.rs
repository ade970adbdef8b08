//! Typed error hierarchy for the deploy pipeline.
//!
//! One enum per seam:
//! - `StorageError`: blob store adapter failures
//! - `TransferError`: transfer batch and per-object failures
//! - `BridgeError`: queue and status store failures
//! - `IntakeError`: deploy request failures
//! - `BuildError`: build worker and build step failures

use std::path::PathBuf;

use thiserror::Error;

/// Errors from a blob store adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object {key} not found")]
    NotFound { key: String },

    #[error("Invalid object key '{key}': {message}")]
    InvalidKey { key: String, message: String },

    #[error("Blob store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to stream body of {key}: {source}")]
    Body {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Body { .. })
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::NotFound { key: path },
            object_store::Error::InvalidPath { source } => Self::InvalidKey {
                key: String::new(),
                message: source.to_string(),
            },
            other => Self::Unavailable(other.to_string()),
        }
    }
}

/// Errors from a transfer batch.
///
/// `Listing` is the only batch-level failure. Every other variant describes a
/// single object and is contained by the worker that hit it.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Listing failed: {0}")]
    Listing(String),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Object key {key} escapes the local root")]
    UnsafeKey { key: String },

    #[error("Transfer of {key} failed: {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Errors from the queue/status bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Status store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("No status recorded for deployment {id}")]
    StatusNotFound { id: String },

    #[error("Unrecognised status '{value}' for deployment {id}")]
    InvalidStatus { id: String, value: String },
}

/// Errors that abort a deploy request.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Invalid repository URL '{url}': {message}")]
    InvalidSource { url: String, message: String },

    #[error("Could not allocate a free deployment id after {attempts} attempts")]
    IdExhausted { attempts: u32 },

    #[error("Failed to reserve working directory {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to clone {url}: {message}")]
    Clone { url: String, message: String },

    #[error("Clone of {url} was cancelled")]
    Cancelled { url: String },

    #[error("Failed to enumerate files of deployment {id}: {message}")]
    Enumerate { id: String, message: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Errors from the build worker and build steps.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Malformed build job '{payload}'")]
    InvalidJob { payload: String },

    #[error("Download of deployment {id} failed: {source}")]
    Download {
        id: String,
        #[source]
        source: TransferError,
    },

    #[error("Build step failed for deployment {id}: {message}")]
    Step { id: String, message: String },

    #[error("Build of deployment {id} was cancelled")]
    Cancelled { id: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
