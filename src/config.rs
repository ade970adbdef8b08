//! Layered configuration for gitbit.
//!
//! Values resolve in order: built-in defaults → `gitbit.toml` → environment
//! (a `.env` file is honoured by the binary) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! intake_listen = "0.0.0.0:1323"
//! router_listen = "0.0.0.0:8080"
//! dev_mode = false
//!
//! [storage]
//! backend = "s3"          # local | memory | s3
//! path = "gitbit"         # directory for local, bucket for s3
//! region = "sa-east-1"
//!
//! [queue]
//! backend = "redis"       # redis | memory
//! url = "redis://127.0.0.1:6379"
//! build_queue = "build-queue"
//! dead_letter_queue = "build-dead-letter"
//!
//! [transfer]
//! workers = 5
//! max_attempts = 2
//! retry_base_ms = 200
//!
//! [intake]
//! workdir = "out"
//! id_length = 5
//! id_attempts = 8
//! shallow = true
//!
//! [worker]
//! workdir = "out"
//! publish = false
//! publish_dir = ""
//!
//! [router]
//! base_prefix = "dist"
//! buffer_limit_bytes = 8388608
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::models::MAX_ID_LENGTH;

pub const DEFAULT_CONFIG_FILE: &str = "gitbit.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Directory on the local filesystem
    #[default]
    Local,
    /// Process-local, lost on exit
    Memory,
    /// S3 or an S3-compatible endpoint
    S3,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageBackend::Local),
            "memory" => Ok(StorageBackend::Memory),
            "s3" => Ok(StorageBackend::S3),
            _ => anyhow::bail!(
                "Invalid storage backend '{}'. Valid values: local, memory, s3",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Redis,
    Memory,
}

impl std::fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueBackend::Redis => write!(f, "redis"),
            QueueBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for QueueBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(QueueBackend::Redis),
            "memory" => Ok(QueueBackend::Memory),
            _ => anyhow::bail!("Invalid queue backend '{}'. Valid values: redis, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_intake_listen")]
    pub intake_listen: String,
    #[serde(default = "default_router_listen")]
    pub router_listen: String,
    /// Permissive CORS on the intake API
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_intake_listen() -> String {
    "0.0.0.0:1323".to_string()
}

fn default_router_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            intake_listen: default_intake_listen(),
            router_listen: default_router_listen(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Base directory (local) or bucket name (s3)
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_storage_path() -> String {
    "blobs".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            region: None,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_build_queue")]
    pub build_queue: String,
    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_build_queue() -> String {
    "build-queue".to_string()
}

fn default_dead_letter_queue() -> String {
    "build-dead-letter".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            url: default_redis_url(),
            build_queue: default_build_queue(),
            dead_letter_queue: default_dead_letter_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Workers spawned per batch
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per object, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_workers() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_base_ms() -> u64 {
    200
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl TransferConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Clones land in `<workdir>/<id>`
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    #[serde(default = "default_id_length")]
    pub id_length: usize,
    /// Fresh ids tried before giving up on a collision streak
    #[serde(default = "default_id_attempts")]
    pub id_attempts: u32,
    /// Depth-1 clones for remote repositories
    #[serde(default = "default_shallow")]
    pub shallow: bool,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("out")
}

fn default_id_length() -> usize {
    5
}

fn default_id_attempts() -> u32 {
    8
}

fn default_shallow() -> bool {
    true
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            id_length: default_id_length(),
            id_attempts: default_id_attempts(),
            shallow: default_shallow(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Downloads land in `<workdir>/<id>`
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Run the publish step after each download
    #[serde(default)]
    pub publish: bool,
    /// Sub-directory of the deployment to publish ("" = whole tree)
    #[serde(default)]
    pub publish_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            publish: false,
            publish_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_base_prefix")]
    pub base_prefix: String,
    /// Objects up to this size are read fully before responding
    #[serde(default = "default_buffer_limit_bytes")]
    pub buffer_limit_bytes: u64,
}

fn default_base_prefix() -> String {
    "dist".to_string()
}

fn default_buffer_limit_bytes() -> u64 {
    8 * 1024 * 1024
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_prefix: default_base_prefix(),
            buffer_limit_bytes: default_buffer_limit_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid gitbit configuration")
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File → process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` so tests can supply a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("GITBIT_REDIS_URL") {
            self.queue.url = url;
        }
        if let Some(backend) = lookup("GITBIT_STORAGE_BACKEND") {
            self.storage.backend = backend.parse()?;
        }
        if let Some(path) = lookup("GITBIT_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Some(bucket) = lookup("S3_BUCKET") {
            self.storage.path = bucket;
        }
        if let Some(region) = lookup("AWS_REGION") {
            self.storage.region = Some(region);
        }
        if let Some(workers) = lookup("GITBIT_TRANSFER_WORKERS") {
            self.transfer.workers = workers
                .parse()
                .with_context(|| format!("Invalid GITBIT_TRANSFER_WORKERS '{}'", workers))?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.transfer.workers == 0 {
            warnings.push("transfer.workers is 0; batches would never make progress".to_string());
        }
        if self.transfer.max_attempts == 0 {
            warnings.push("transfer.max_attempts is 0; treated as 1".to_string());
        }
        if self.intake.id_length == 0 || self.intake.id_length > MAX_ID_LENGTH {
            warnings.push(format!(
                "intake.id_length {} outside 1..={}; it will be clamped",
                self.intake.id_length, MAX_ID_LENGTH
            ));
        }
        if !crate::pipeline::build::is_safe_publish_dir(&self.worker.publish_dir) {
            warnings.push(format!(
                "worker.publish_dir '{}' leaves the deployment tree; publishing will fail",
                self.worker.publish_dir
            ));
        }
        if self.storage.backend == StorageBackend::Memory || self.queue.backend == QueueBackend::Memory {
            warnings.push(
                "memory backends are process-local; intake, worker and router must share one process"
                    .to_string(),
            );
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.region.is_none() {
            warnings.push("storage.region is unset; the AWS default chain decides".to_string());
        }
        if self.router.base_prefix.trim_matches('/').is_empty() {
            warnings.push("router.base_prefix is empty; the router would serve source trees".to_string());
        }

        warnings
    }
}
