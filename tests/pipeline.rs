//! End-to-end pipeline test on in-memory adapters.
//!
//! A real git repository goes through intake, the build worker with the
//! publish step, and comes out of the static router.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use git2::{Repository, Signature};
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use gitbit::config::{Config, QueueBackend, StorageBackend};
use gitbit::pipeline::bridge::QueueBridge;
use gitbit::pipeline::models::{DeploymentId, DeploymentStatus};
use gitbit::pipeline::server::{build_intake_router, build_static_router};
use gitbit::pipeline::storage::{BlobStore, ObjectStoreBlobs};
use gitbit::services::Services;

fn init_repo(dir: &Path, files: &[(&str, &str)]) {
    let repo = Repository::init(dir).unwrap();
    for (rel, content) in files {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("gitbit", "gitbit@localhost").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
}

struct Harness {
    services: Services,
    blobs: ObjectStoreBlobs,
    _intake_dir: tempfile::TempDir,
    _worker_dir: tempfile::TempDir,
}

fn harness(publish: bool) -> Harness {
    let intake_dir = tempfile::tempdir().unwrap();
    let worker_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.queue.backend = QueueBackend::Memory;
    config.intake.workdir = intake_dir.path().to_path_buf();
    config.worker.workdir = worker_dir.path().to_path_buf();
    config.worker.publish = publish;
    config.transfer.retry_base_ms = 1;

    let blobs = ObjectStoreBlobs::in_memory();
    let bridge = QueueBridge::in_memory(&config.queue);
    let services = Services::with_adapters(config, Arc::new(blobs.clone()), bridge);
    Harness {
        services,
        blobs,
        _intake_dir: intake_dir,
        _worker_dir: worker_dir,
    }
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn wait_for_status(bridge: &QueueBridge, id: &DeploymentId, want: DeploymentStatus) {
    for _ in 0..400 {
        if let Ok(status) = bridge.get_status(id).await {
            if status == want {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("deployment {id} never reached {want}");
}

#[tokio::test]
async fn deploy_build_and_serve() {
    let repo = tempfile::tempdir().unwrap();
    init_repo(
        repo.path(),
        &[
            ("index.html", "<h1>home</h1>"),
            ("css/site.css", "body{color:red}"),
            ("js/app.js", "console.log('hi')"),
        ],
    );
    let h = harness(true);
    let shutdown = CancellationToken::new();

    let worker = tokio::spawn(Arc::new(h.services.build_worker()).run(shutdown.clone()));
    let intake = build_intake_router(h.services.intake_state(shutdown.clone()), false);
    let router = build_static_router(h.services.router_state());

    let request = Request::builder()
        .method("POST")
        .uri("/deploy")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "repo": repo.path().to_str().unwrap() }).to_string(),
        ))
        .unwrap();
    let response = intake.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    let id = DeploymentId::parse(body["id"].as_str().unwrap()).unwrap();

    // Source tree uploaded without repository metadata.
    let mut source_keys = h.blobs.list(&id.source_prefix()).await.unwrap();
    source_keys.sort();
    assert_eq!(
        source_keys,
        vec![
            format!("{id}/css/site.css"),
            format!("{id}/index.html"),
            format!("{id}/js/app.js"),
        ]
    );

    wait_for_status(&h.services.bridge, &id, DeploymentStatus::Ready).await;

    let status = intake
        .oneshot(
            Request::builder()
                .uri(format!("/status/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_text(status).await, "ready");

    let host = format!("{id}.sites.example.com:8080");
    for (path, content_type, content) in [
        ("/", "text/html", "<h1>home</h1>"),
        ("/css/site.css", "text/css", "body{color:red}"),
        ("/js/app.js", "application/javascript", "console.log('hi')"),
    ] {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(path)
                    .header("host", &host)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        assert_eq!(response.headers()[header::CONTENT_TYPE], content_type);
        assert_eq!(body_text(response).await, content);
    }

    let missing = router
        .oneshot(
            Request::builder()
                .uri("/nope.js")
                .header("host", &host)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(missing).await, "404 Not Found");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn without_publish_status_stays_uploaded() {
    let repo = tempfile::tempdir().unwrap();
    init_repo(repo.path(), &[("index.html", "<h1>home</h1>")]);
    let h = harness(false);
    let shutdown = CancellationToken::new();

    let receipt = h
        .services
        .intake()
        .submit(repo.path().to_str().unwrap(), &shutdown)
        .await
        .unwrap();

    let worker = h.services.build_worker();
    let payload = h.services.bridge.next_build().await.unwrap();
    assert_eq!(payload, receipt.id.as_str());
    let report = worker.process(&payload, &shutdown).await.unwrap();
    assert_eq!(report.transferred, 1);

    assert_eq!(
        h.services.bridge.get_status(&receipt.id).await.unwrap(),
        DeploymentStatus::Uploaded
    );
    assert!(h.blobs.list("dist/").await.unwrap().is_empty());
}
