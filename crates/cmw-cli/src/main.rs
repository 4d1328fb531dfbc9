use anyhow::Result;
use clap::{Parser, Subcommand};
use cmw_sync::{load_source_registry, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cmw-cli")]
#[command(about = "Coin Metrics Warehouse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source, reconcile into the warehouse, export CSVs.
    Sync,
    /// List the configured sources and whether they are enabled.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = cmw_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} succeeded={} failed={}",
                summary.run_id, summary.enabled_sources, summary.succeeded, summary.failed
            );
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = load_source_registry(&config.sources_file)?;
            for source in &registry.sources {
                println!(
                    "{}\tenabled={}\tformat={:?}",
                    source.source_key, source.enabled, source.format
                );
            }
        }
    }
    Ok(())
}
