use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watch the physioswiss job board and report new postings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the listing page once and report what is new (default).
    Sync,
    /// Delete the most recently posted listings so the next sync reports them again.
    Prune {
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Run the sync on JOBWATCH_SYNC_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = jobwatch_sync::run_sync_once_from_env().await?;
            info!(
                run_id = %summary.run_id,
                snapshot = summary.snapshot_size,
                new_listings = summary.new_listings,
                new_employers = summary.new_employers,
                stored = summary.stored_total,
                "sync complete"
            );
        }
        Commands::Prune { count } => {
            let deleted = jobwatch_sync::run_prune_from_env(count).await?;
            print!("{}", jobwatch_sync::render_prune_summary(&deleted));
            info!(deleted = deleted.len(), "prune complete");
        }
        Commands::Schedule => {
            jobwatch_sync::run_scheduled_from_env().await?;
        }
    }

    Ok(())
}
