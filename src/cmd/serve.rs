//! Long-running services: `gitbit intake|worker|router|all`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gitbit::config::Config;
use gitbit::pipeline::server::{
    build_intake_router, build_static_router, cancel_on_ctrl_c, serve,
};
use gitbit::services::Services;

pub async fn cmd_intake(mut config: Config, listen: Option<String>) -> Result<()> {
    if let Some(addr) = listen {
        config.server.intake_listen = addr;
    }
    let services = Services::connect(config).await?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let app = build_intake_router(
        services.intake_state(shutdown.clone()),
        services.config.server.dev_mode,
    );
    serve("intake", &services.config.server.intake_listen, app, shutdown).await
}

pub async fn cmd_router(mut config: Config, listen: Option<String>) -> Result<()> {
    if let Some(addr) = listen {
        config.server.router_listen = addr;
    }
    let services = Services::connect(config).await?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let app = build_static_router(services.router_state());
    serve("router", &services.config.server.router_listen, app, shutdown).await
}

pub async fn cmd_worker(config: Config) -> Result<()> {
    let services = Services::connect(config).await?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    Arc::new(services.build_worker()).run(shutdown).await;
    Ok(())
}

pub async fn cmd_all(config: Config) -> Result<()> {
    let services = Services::connect(config).await?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let worker = tokio::spawn(Arc::new(services.build_worker()).run(shutdown.clone()));

    let intake_app = build_intake_router(
        services.intake_state(shutdown.clone()),
        services.config.server.dev_mode,
    );
    let router_app = build_static_router(services.router_state());

    let served = tokio::try_join!(
        serve(
            "intake",
            &services.config.server.intake_listen,
            intake_app,
            shutdown.clone()
        ),
        serve(
            "router",
            &services.config.server.router_listen,
            router_app,
            shutdown.clone()
        ),
    );

    // Either server failing takes the whole process down.
    shutdown.cancel();
    worker.await.context("Build worker task failed")?;
    served?;
    info!("all services stopped");
    Ok(())
}
