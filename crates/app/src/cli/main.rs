//! audiohal CLI Application

mod scenario;

use anyhow::Context;
use audiohal_core::domain::config::{ConfigManager, ModuleConfigFile};
use audiohal_infra::audio::WorkerStreamFactory;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "audiohal")]
#[command(about = "Audio HAL module: ports, routes, patches and device connections", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Module description (defaults to the file in the user's config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the module graph as JSON
    Dump,
    /// Execute the client operations listed in a scenario file
    Run {
        scenario: PathBuf,
    },
}

async fn load_module_file(path: Option<PathBuf>) -> anyhow::Result<ModuleConfigFile> {
    match path {
        Some(path) => ModuleConfigFile::load_from_file(&path)
            .await
            .with_context(|| format!("loading module description {}", path.display())),
        None => {
            let manager = ConfigManager::new(ConfigManager::default_config_dir()?);
            Ok(manager.load().await)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("audiohal starting...");

    let file = load_module_file(cli.config).await?;
    let factory = Arc::new(WorkerStreamFactory::new());

    let events = factory.events();
    std::thread::spawn(move || {
        for event in events.iter() {
            tracing::debug!(?event, "Stream worker event");
        }
    });

    let module = scenario::build_module(&file, factory)?;

    match cli.command {
        Command::Dump => {
            println!("{}", serde_json::to_string_pretty(&module.snapshot())?);
        }
        Command::Run { scenario: path } => {
            let scenario = scenario::Scenario::load(&path).await?;
            let outcomes = scenario::run_scenario(&module, &scenario);
            let failed = outcomes.iter().filter(|o| o["ok"] == false).count();
            for outcome in &outcomes {
                println!("{}", serde_json::to_string(outcome)?);
            }
            tracing::info!(steps = outcomes.len(), failed, "Scenario finished");
        }
    }

    Ok(())
}
