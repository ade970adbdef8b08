//! Bounded-concurrency transfer of a batch of objects between the local
//! filesystem and the blob store.
//!
//! One producer feeds a capacity-1 channel; `workers` tasks share the
//! receiving end and each move one object at a time. The batch completes
//! when the producer is done and every worker has drained the channel.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::models::{Direction, FailedObject, TransferItem, TransferReport};
use super::storage::BlobStore;
use crate::config::TransferConfig;
use crate::errors::TransferError;

/// Produces the identifiers of one batch. Called once, before any worker
/// starts; an error aborts the whole batch.
#[async_trait]
pub trait Lister: Send + Sync {
    async fn list(&self) -> Result<Vec<TransferItem>, TransferError>;
}

/// Recursive walk of a local directory. Each regular file becomes
/// `<key_prefix><relative path>`. Any `.git` directory and every symbolic
/// link are skipped, so nothing outside the root is ever read.
#[derive(Debug, Clone)]
pub struct FsLister {
    root: PathBuf,
    key_prefix: String,
}

impl FsLister {
    pub fn new(root: impl Into<PathBuf>, key_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl Lister for FsLister {
    async fn list(&self) -> Result<Vec<TransferItem>, TransferError> {
        let root = self.root.clone();
        let prefix = self.key_prefix.clone();
        tokio::task::spawn_blocking(move || walk_files(&root, &prefix))
            .await
            .map_err(|e| TransferError::Listing(format!("walk task failed: {e}")))?
    }
}

fn walk_files(root: &Path, key_prefix: &str) -> Result<Vec<TransferItem>, TransferError> {
    let mut items = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| {
            TransferError::Listing(format!("failed to walk {}: {e}", root.display()))
        })?;
        if entry.file_type().is_symlink() {
            debug!(path = %entry.path().display(), "skipping symbolic link");
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| TransferError::Listing(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        items.push(TransferItem {
            key: format!("{key_prefix}{rel}"),
            local: entry.path().to_path_buf(),
        });
    }
    Ok(items)
}

/// Every object under a blob prefix, mapped to `<local_root>/<key>`.
pub struct BlobLister {
    blobs: Arc<dyn BlobStore>,
    prefix: String,
    local_root: PathBuf,
}

impl BlobLister {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        prefix: impl Into<String>,
        local_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            blobs,
            prefix: prefix.into(),
            local_root: local_root.into(),
        }
    }
}

#[async_trait]
impl Lister for BlobLister {
    async fn list(&self) -> Result<Vec<TransferItem>, TransferError> {
        let keys = self
            .blobs
            .list(&self.prefix)
            .await
            .map_err(|e| TransferError::Listing(format!("prefix {}: {e}", self.prefix)))?;
        Ok(keys
            .into_iter()
            .map(|key| TransferItem {
                local: self.local_root.join(&key),
                key,
            })
            .collect())
    }
}

/// Keys that would land outside the local root are refused.
fn ensure_safe_key(key: &str) -> Result<(), TransferError> {
    let safe = !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(TransferError::UnsafeKey {
            key: key.to_string(),
        })
    }
}

/// Transfer executor. Cheap to clone; each [`run`](Self::run) is an
/// independent batch.
#[derive(Clone)]
pub struct TransferPool {
    blobs: Arc<dyn BlobStore>,
    workers: usize,
    max_attempts: u32,
    retry_base: Duration,
}

impl TransferPool {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &TransferConfig) -> Self {
        Self {
            blobs,
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_base: config.retry_base(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Move every listed object in `direction`.
    ///
    /// Only a listing failure is returned as `Err`. Per-object failures are
    /// logged and collected in the report.
    pub async fn run(
        &self,
        direction: Direction,
        lister: &dyn Lister,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, TransferError> {
        let items = lister.list().await?;
        let total = items.len();
        info!(%direction, objects = total, workers = self.workers, "transfer batch started");

        let (tx, rx) = mpsc::channel::<TransferItem>(1);
        let rx = Arc::new(Mutex::new(rx));

        let mut set = JoinSet::new();
        for worker_id in 0..self.workers {
            let worker = Worker {
                id: worker_id,
                blobs: Arc::clone(&self.blobs),
                direction,
                max_attempts: self.max_attempts,
                retry_base: self.retry_base,
                cancel: cancel.clone(),
            };
            let rx = Arc::clone(&rx);
            set.spawn(async move { worker.drain(rx).await });
        }

        for item in items {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);

        let mut report = TransferReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => error!(error = %e, "transfer worker task failed"),
            }
        }
        report.cancelled = cancel.is_cancelled() && report.attempted < total;

        info!(
            %direction,
            attempted = report.attempted,
            transferred = report.transferred,
            failed = report.failed.len(),
            bytes = report.bytes,
            cancelled = report.cancelled,
            "transfer batch finished"
        );
        Ok(report)
    }
}

struct Worker {
    id: usize,
    blobs: Arc<dyn BlobStore>,
    direction: Direction,
    max_attempts: u32,
    retry_base: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn drain(self, rx: Arc<Mutex<mpsc::Receiver<TransferItem>>>) -> TransferReport {
        let mut report = TransferReport::default();
        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(item) = next else { break };

            report.attempted += 1;
            match self.transfer_with_retry(&item).await {
                Ok(bytes) => {
                    report.transferred += 1;
                    report.bytes += bytes;
                    debug!(worker = self.id, key = %item.key, bytes, "object transferred");
                }
                Err(e) => {
                    warn!(worker = self.id, key = %item.key, error = %e, "object transfer failed");
                    report.failed.push(FailedObject {
                        key: item.key.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn transfer_with_retry(&self, item: &TransferItem) -> Result<u64, TransferError> {
        let mut attempt = 1;
        loop {
            let result = match self.direction {
                Direction::Upload => self.upload(item).await,
                Direction::Download => self.download(item).await,
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.retry_base * 2u32.saturating_pow(attempt - 1);
                    debug!(key = %item.key, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying object");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn upload(&self, item: &TransferItem) -> Result<u64, TransferError> {
        let file = tokio::fs::File::open(&item.local)
            .await
            .map_err(|e| TransferError::OpenFile {
                path: item.local.clone(),
                source: e,
            })?;
        self.blobs
            .put(&item.key, Box::new(file))
            .await
            .map_err(|e| TransferError::Storage {
                key: item.key.clone(),
                source: e,
            })
    }

    async fn download(&self, item: &TransferItem) -> Result<u64, TransferError> {
        ensure_safe_key(&item.key)?;
        if let Some(parent) = item.local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::CreateDir {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let object = self
            .blobs
            .get(&item.key)
            .await
            .map_err(|e| TransferError::Storage {
                key: item.key.clone(),
                source: e,
            })?;

        let tmp = temp_sibling(&item.local);
        let written = match write_stream(&tmp, object.body, &item.key).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp, &item.local).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(TransferError::WriteFile {
                path: item.local.clone(),
                source: e,
            });
        }
        Ok(written)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    path.with_file_name(format!(".{name}.{suffix}.partial"))
}

async fn write_stream(
    path: &Path,
    mut body: super::storage::ByteStream,
    key: &str,
) -> Result<u64, TransferError> {
    let write_err = |e| TransferError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(write_err)?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| TransferError::Storage {
            key: key.to_string(),
            source: e,
        })?;
        file.write_all(&chunk).await.map_err(write_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_err)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::pipeline::storage::{BlobObject, ObjectStoreBlobs};
    use std::collections::HashSet;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncRead;

    fn config(workers: usize) -> TransferConfig {
        TransferConfig {
            workers,
            max_attempts: 2,
            retry_base_ms: 1,
        }
    }

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    async fn put_str(blobs: &ObjectStoreBlobs, key: &str, content: &str) {
        blobs
            .put(key, Box::new(std::io::Cursor::new(content.as_bytes().to_vec())))
            .await
            .unwrap();
    }

    struct FailingLister;

    #[async_trait]
    impl Lister for FailingLister {
        async fn list(&self) -> Result<Vec<TransferItem>, TransferError> {
            Err(TransferError::Listing("store down".into()))
        }
    }

    struct FixedLister(Vec<TransferItem>);

    #[async_trait]
    impl Lister for FixedLister {
        async fn list(&self) -> Result<Vec<TransferItem>, TransferError> {
            Ok(self.0.clone())
        }
    }

    /// Wraps a real store; counts calls, tracks concurrency and can fail
    /// the first `fail_first` gets with a transient error.
    struct InstrumentedBlobs {
        inner: ObjectStoreBlobs,
        fail_first: usize,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl InstrumentedBlobs {
        fn new(inner: ObjectStoreBlobs, fail_first: usize) -> Self {
            Self {
                inner,
                fail_first,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        async fn track<T>(&self, fut: impl std::future::Future<Output = T>) -> T {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            let out = fut.await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out
        }
    }

    #[async_trait]
    impl BlobStore for InstrumentedBlobs {
        async fn put(
            &self,
            key: &str,
            body: Box<dyn AsyncRead + Send + Unpin>,
        ) -> Result<u64, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.track(self.inner.put(key, body)).await
        }

        async fn get(&self, key: &str) -> Result<BlobObject, StorageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(StorageError::Unavailable("flaky".into()));
            }
            self.track(self.inner.get(key)).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_upload_key_set_matches_walked_tree() {
        let src = tempfile::tempdir().unwrap();
        write_tree(
            src.path(),
            &[
                ("index.html", "<h1>hi</h1>"),
                ("css/style.css", "body{}"),
                ("js/deep/app.js", "1"),
                (".git/HEAD", "ref: refs/heads/main"),
            ],
        );
        let blobs = ObjectStoreBlobs::in_memory();
        let pool = TransferPool::new(Arc::new(blobs.clone()), &config(5));

        let report = pool
            .run(
                Direction::Upload,
                &FsLister::new(src.path(), "abc12/"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.transferred, 3);
        let keys: HashSet<String> = blobs.list("abc12/").await.unwrap().into_iter().collect();
        let expected: HashSet<String> = ["abc12/index.html", "abc12/css/style.css", "abc12/js/deep/app.js"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(keys, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_never_uploaded() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("host-secret.env"), "AWS_SECRET_ACCESS_KEY=hunter2").unwrap();
        let src = tempfile::tempdir().unwrap();
        write_tree(src.path(), &[("index.html", "<h1>hi</h1>")]);
        std::os::unix::fs::symlink(
            outside.path().join("host-secret.env"),
            src.path().join("leak.js"),
        )
        .unwrap();
        std::os::unix::fs::symlink(outside.path(), src.path().join("linked-dir")).unwrap();
        let blobs = ObjectStoreBlobs::in_memory();
        let pool = TransferPool::new(Arc::new(blobs.clone()), &config(2));

        let report = pool
            .run(
                Direction::Upload,
                &FsLister::new(src.path(), "abc12/"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(blobs.list("abc12/").await.unwrap(), vec!["abc12/index.html"]);
    }

    #[tokio::test]
    async fn test_download_materialises_tree_and_is_idempotent() {
        let blobs = ObjectStoreBlobs::in_memory();
        put_str(&blobs, "abc12/index.html", "<h1>hi</h1>").await;
        put_str(&blobs, "abc12/css/style.css", "body{}").await;
        let blobs: Arc<dyn BlobStore> = Arc::new(blobs);

        let out = tempfile::tempdir().unwrap();
        let pool = TransferPool::new(Arc::clone(&blobs), &config(3));
        let lister = BlobLister::new(Arc::clone(&blobs), "abc12/", out.path());

        for _ in 0..2 {
            let report = pool
                .run(Direction::Download, &lister, &CancellationToken::new())
                .await
                .unwrap();
            assert!(report.is_complete());
            assert_eq!(report.transferred, 2);
            assert_eq!(report.bytes, 17);
        }
        assert_eq!(
            fs::read_to_string(out.path().join("abc12/index.html")).unwrap(),
            "<h1>hi</h1>"
        );
        assert_eq!(
            fs::read_to_string(out.path().join("abc12/css/style.css")).unwrap(),
            "body{}"
        );
        let leftovers: Vec<_> = fs::read_dir(out.path().join("abc12"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_batch() {
        let blobs = Arc::new(InstrumentedBlobs::new(ObjectStoreBlobs::in_memory(), 0));
        let pool = TransferPool::new(blobs.clone(), &config(5));
        let err = pool
            .run(Direction::Download, &FailingLister, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Listing(_)));
        assert_eq!(blobs.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_identifier_attempted_once_with_bounded_workers() {
        let inner = ObjectStoreBlobs::in_memory();
        let mut items = Vec::new();
        let out = tempfile::tempdir().unwrap();
        for i in 0..23 {
            let key = format!("abc12/file-{i}.js");
            put_str(&inner, &key, "x").await;
            items.push(TransferItem {
                local: out.path().join(&key),
                key,
            });
        }
        let blobs = Arc::new(InstrumentedBlobs::new(inner, 0));
        let pool = TransferPool::new(blobs.clone(), &config(5));

        let report = pool
            .run(Direction::Download, &FixedLister(items), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted, 23);
        assert_eq!(report.transferred, 23);
        assert_eq!(blobs.calls.load(Ordering::SeqCst), 23);
        assert!(blobs.max_in_flight.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_per_object_failure_is_contained() {
        let inner = ObjectStoreBlobs::in_memory();
        put_str(&inner, "abc12/present.html", "ok").await;
        let out = tempfile::tempdir().unwrap();
        let items = vec![
            TransferItem {
                key: "abc12/present.html".into(),
                local: out.path().join("abc12/present.html"),
            },
            TransferItem {
                key: "abc12/missing.html".into(),
                local: out.path().join("abc12/missing.html"),
            },
        ];
        let pool = TransferPool::new(Arc::new(inner), &config(2));

        let report = pool
            .run(Direction::Download, &FixedLister(items), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.transferred, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "abc12/missing.html");
        assert!(!out.path().join("abc12/missing.html").exists());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let inner = ObjectStoreBlobs::in_memory();
        put_str(&inner, "abc12/a.css", "a").await;
        let blobs = Arc::new(InstrumentedBlobs::new(inner, 1));
        let out = tempfile::tempdir().unwrap();
        let pool = TransferPool::new(blobs.clone(), &config(1));
        let items = vec![TransferItem {
            key: "abc12/a.css".into(),
            local: out.path().join("abc12/a.css"),
        }];

        let report = pool
            .run(Direction::Download, &FixedLister(items), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.attempted, 1);
        assert_eq!(blobs.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let inner = ObjectStoreBlobs::in_memory();
        put_str(&inner, "abc12/a.css", "a").await;
        let blobs = Arc::new(InstrumentedBlobs::new(inner, 10));
        let out = tempfile::tempdir().unwrap();
        let pool = TransferPool::new(blobs.clone(), &config(1));
        let items = vec![TransferItem {
            key: "abc12/a.css".into(),
            local: out.path().join("abc12/a.css"),
        }];

        let report = pool
            .run(Direction::Download, &FixedLister(items), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(blobs.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsafe_key_is_refused() {
        let out = tempfile::tempdir().unwrap();
        let items = vec![TransferItem {
            key: "../escape.js".into(),
            local: out.path().join("../escape.js"),
        }];
        let pool = TransferPool::new(Arc::new(ObjectStoreBlobs::in_memory()), &config(1));
        let report = pool
            .run(Direction::Download, &FixedLister(items), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("escapes"));
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_cancellation() {
        let src = tempfile::tempdir().unwrap();
        write_tree(src.path(), &[("a.html", "a"), ("b.html", "b")]);
        let blobs = ObjectStoreBlobs::in_memory();
        let pool = TransferPool::new(Arc::new(blobs.clone()), &config(2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = pool
            .run(Direction::Upload, &FsLister::new(src.path(), "abc12/"), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(!report.is_complete());
        assert_eq!(report.attempted, 0);
        assert!(blobs.list("abc12/").await.unwrap().is_empty());
    }

    #[test]
    fn test_safe_key_rules() {
        assert!(ensure_safe_key("abc12/css/a.css").is_ok());
        assert!(ensure_safe_key("").is_err());
        assert!(ensure_safe_key("/etc/passwd").is_err());
        assert!(ensure_safe_key("abc12/../../x").is_err());
    }
}
