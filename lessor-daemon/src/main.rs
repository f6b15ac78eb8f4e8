//! # Lessor
//!
//! Provider daemon for a decentralized compute marketplace. It follows the
//! marketplace event stream, bids on compatible orders, provisions matched
//! leases on the configured backend and keeps their lifecycle in step with
//! the chain.

mod inspect;
mod serve;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lessor_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use lessor_core::lifecycle::CommandState;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "lessor")]
#[command(about = "Off-chain provider orchestration for the compute marketplace")]
struct Cli {
    /// Config file (TOML or JSON)
    #[arg(long, global = true, env = "LESSOR_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Environment file read before the configuration is resolved
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the provider (default)
    Run,
    /// Inspect or repair the lifecycle command queue
    #[command(subcommand)]
    Queue(QueueCommand),
    #[command(subcommand)]
    Checkpoint(CheckpointCommand),
    #[command(subcommand)]
    Routing(RoutingCommand),
}

#[derive(Debug, Subcommand)]
enum QueueCommand {
    /// Print lifecycle commands, optionally only those in one state
    List {
        #[arg(long)]
        state: Option<CommandState>,
    },
    /// Return a stale or failed command to the queue
    Requeue { command_id: Uuid },
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    /// Print the persisted event cursor
    Show,
}

#[derive(Debug, Subcommand)]
enum RoutingCommand {
    /// Print every routing record
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad {
        config,
        source,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config,
        env_file: cli.env_file,
        search_dir: None,
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(?source, "configuration loaded");
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve::run(config).await,
        Command::Queue(QueueCommand::List { state }) => inspect::list_queue(&config, state).await,
        Command::Queue(QueueCommand::Requeue { command_id }) => {
            inspect::requeue(&config, command_id).await
        }
        Command::Checkpoint(CheckpointCommand::Show) => inspect::show_checkpoint(&config).await,
        Command::Routing(RoutingCommand::List) => inspect::list_routing(&config).await,
    }
}
