use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for `intake.id_length`: the hex digits of a UUID.
pub const MAX_ID_LENGTH: usize = 32;

/// Short opaque deployment identifier.
///
/// Generated by truncating a random UUIDv4 (hex form) to a fixed prefix.
/// Short lengths are a probabilistic namespace, so the intake checks for
/// collisions before using one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    pub fn generate(length: usize) -> Self {
        let length = length.clamp(1, MAX_ID_LENGTH);
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(hex[..length].to_string())
    }

    /// Accept an id coming from outside (queue payload, URL segment).
    ///
    /// Ids end up in filesystem paths and blob keys, so only ASCII
    /// alphanumerics, `-` and `_` are allowed.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blob prefix holding this deployment's source tree.
    pub fn source_prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Uploaded,
    Queued,
    Building,
    Ready,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "queued" => Ok(Self::Queued),
            "building" => Ok(Self::Building),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(id: DeploymentId, source_url: &str) -> Self {
        Self {
            id,
            source_url: source_url.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// What the intake hands back to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentReceipt {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of transfer work: a blob key paired with its local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub key: String,
    pub local: std::path::PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedObject {
    pub key: String,
    pub error: String,
}

/// Outcome of one transfer batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferReport {
    /// Identifiers picked up by a worker (each counted once, retries excluded).
    pub attempted: usize,
    pub transferred: usize,
    pub bytes: u64,
    pub failed: Vec<FailedObject>,
    pub cancelled: bool,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed.is_empty()
    }

    pub(crate) fn merge(&mut self, other: TransferReport) {
        self.attempted += other.attempted;
        self.transferred += other.transferred;
        self.bytes += other.bytes;
        self.failed.extend(other.failed);
        self.cancelled |= other.cancelled;
    }
}
