//! One-shot deploy from the command line: `gitbit submit <repo>`.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use gitbit::config::Config;
use gitbit::pipeline::server::cancel_on_ctrl_c;
use gitbit::services::Services;

pub async fn cmd_submit(config: Config, repo: &str) -> Result<()> {
    let services = Services::connect(config).await?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let receipt = services
        .intake()
        .submit(repo, &cancel)
        .await
        .with_context(|| format!("Failed to deploy {repo}"))?;

    println!("{}", receipt.id);
    Ok(())
}
