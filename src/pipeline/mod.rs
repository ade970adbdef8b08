//! Deploy pipeline: git repository in, static site out.
//!
//! ## Overview
//!
//! A deploy request names a git repository. Intake clones it, uploads every
//! file to the blob store under `<id>/` and queues a build job. The build
//! worker pops jobs, downloads the tree and optionally publishes it under
//! `dist/<id>/`. The static router serves `dist/<tenant>/<path>` to any host
//! whose leading label is the deployment id.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  POST /deploy  ┌──────────────────────────────────────────┐
//! │  Client  │ ─────────────> │  api.rs  (handlers, AppState, ApiError)  │
//! └──────────┘                │    │ IntakeCoordinator::submit()         │
//!                             │    v                                     │
//!                             │  intake.rs ──> source.rs  (git2 clone)   │
//!                             │    │                                     │
//!                             │    │ TransferPool::run(Upload)           │
//!                             │    v                                     │
//!                             │  transfer.rs ──> storage.rs  (BlobStore) │
//!                             │    │                                     │
//!                             │    │ QueueBridge::enqueue_build()        │
//!                             │    v                                     │
//!                             │  bridge/  (WorkQueue, StatusStore)       │
//!                             └────┬─────────────────────────────────────┘
//!                                  │ blocking pop
//!                             ┌────v─────────────────────────────────────┐
//!                             │  worker.rs  (BuildWorker)                │
//!                             │    │ TransferPool::run(Download)         │
//!                             │    v                                     │
//!                             │  build.rs  (BuildStep, PublishStep)      │
//!                             └──────────────────────────────────────────┘
//!                             ┌──────────────────────────────────────────┐
//! ┌──────────┐  GET <path>    │  router.rs  (Host → tenant → blob key)   │
//! │ Browser  │ ─────────────> │                                          │
//! └──────────┘                └──────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                           |
//! |-----------|----------------------------------------------------------|
//! | `models`  | `DeploymentId`, `DeploymentStatus`, `TransferReport`     |
//! | `server`  | axum wiring, tracing/CORS layers, graceful shutdown      |

pub mod api;
pub mod bridge;
pub mod build;
pub mod intake;
pub mod models;
pub mod router;
pub mod server;
pub mod source;
pub mod storage;
pub mod transfer;
pub mod worker;
