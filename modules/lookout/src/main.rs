use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lookout_core::{config, Actor, MessageBus, PluginContext};

#[derive(Parser)]
#[command(name = "lookout", about = "Watch content sources and route records through chains")]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "lookout.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lookout=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let registry = lookout_plugins::builtin();
    registry.log_loaded();

    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config file {}", args.config.display()))?;

    let bus = Arc::new(MessageBus::new());
    let ctx = PluginContext {
        bus: Arc::clone(&bus),
    };
    let (actors, chains) = match config::parse(&registry, &ctx, &text).await {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!(actors = actors.len(), chains = chains.len(), "configuration loaded");

    for (name, actor) in actors {
        info!(actor = %name, "starting");
        tokio::spawn(actor.run());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
