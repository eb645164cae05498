use anyhow::Result;
use clap::{Parser, Subcommand};
use rpwatch_storage::TrialStore;
use rpwatch_sync::{Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rpwatch-cli")]
#[command(about = "Watches the clinical-trials registry for new RP studies")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, extract, dedupe, and persist new trials (default).
    Run,
    /// Fetch the registry window and refresh the cache file only.
    Fetch,
    /// Create the trials table if the database does not have it yet.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = rpwatch_sync::run_pipeline_from_env().await?;
            println!(
                "run complete: run_id={} studies={} inserted={} skipped={} failed={} fresh_fetch={}",
                summary.run_id,
                summary.studies,
                summary.inserted,
                summary.skipped_existing,
                summary.failed,
                summary.fetched_fresh
            );
        }
        Commands::Fetch => {
            let config = PipelineConfig::from_env();
            let bytes = Pipeline::new(&config)?.fetch_once().await?;
            println!(
                "fetched {bytes} bytes into {}",
                config.cache_path.display()
            );
        }
        Commands::InitDb => {
            let config = PipelineConfig::from_env();
            TrialStore::from_config(&config.db).ensure_table().await?;
            println!("trials table ready");
        }
    }

    Ok(())
}
