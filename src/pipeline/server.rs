use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::api::{self, SharedState};
use super::router::{self, SharedRouterState};

pub fn build_intake_router(state: SharedState, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

pub fn build_static_router(state: SharedRouterState) -> Router {
    router::static_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind `addr` and serve `app` until `shutdown` fires.
pub async fn serve(name: &str, addr: &str, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {name} to {addr}"))?;
    serve_on(name, listener, app, shutdown).await
}

pub async fn serve_on(
    name: &str,
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(server = name, addr = %local_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{name} server error"))?;

    info!(server = name, "shut down gracefully");
    Ok(())
}

/// Cancel `token` on Ctrl+C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C, shutting down"),
        }
        token.cancel();
    });
}
