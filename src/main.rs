use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gitbit::config::{Config, DEFAULT_CONFIG_FILE};
use gitbit::logging::{LogFormat, init_logging};

mod cmd;

#[derive(Parser)]
#[command(name = "gitbit")]
#[command(version, about = "Deploy static sites straight from git repositories")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file. Missing files fall back to defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the intake HTTP API (POST /deploy, GET /status/{id})
    Intake {
        /// Listen address, overrides server.intake_listen
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run the build worker loop
    Worker,
    /// Run the static router
    Router {
        /// Listen address, overrides server.router_listen
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run intake, worker and router in one process
    All,
    /// Submit one repository locally and print its deployment id
    Submit {
        /// Repository URL or absolute path
        repo: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    let config = Config::resolve(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match &cli.command {
        Commands::Intake { listen } => cmd::cmd_intake(config, listen.clone()).await?,
        Commands::Worker => cmd::cmd_worker(config).await?,
        Commands::Router { listen } => cmd::cmd_router(config, listen.clone()).await?,
        Commands::All => cmd::cmd_all(config).await?,
        Commands::Submit { repo } => cmd::cmd_submit(config, repo).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
    }

    Ok(())
}
