use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mli_ingest::{ListingMonitor, MonitorConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mli")]
#[command(about = "Marketplace listing export monitor")]
struct Cli {
    /// Override the watched export directory.
    #[arg(long)]
    watch_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch for new export files and upload new listings indefinitely.
    Watch,
    /// Ingest and upload a single export file, then exit.
    Ingest { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = MonitorConfig::from_env();
    if let Some(dir) = cli.watch_dir {
        config.watch_dir = dir;
    }

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            let monitor = ListingMonitor::new(config)?;
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("shutdown signal received; finishing in-flight work");
                        let _ = shutdown_tx.send(true);
                    }
                    // Keep the sender alive so a failed handler install does
                    // not read as an immediate shutdown.
                    Err(_) => std::future::pending::<()>().await,
                }
            });
            monitor.run(shutdown_rx).await?;
        }
        Commands::Ingest { path } => {
            let monitor = ListingMonitor::new(config)?;
            monitor.bootstrap().await;
            let summary = monitor.process_file(&path).await?;
            println!(
                "ingest complete: rows={} accepted={} rejected={} duplicates={} uploaded={} failed={}",
                summary.stats.total_rows,
                summary.stats.accepted,
                summary.stats.rejected,
                summary.stats.duplicates + summary.skipped_duplicates,
                summary.uploaded,
                summary.failed
            );
        }
    }

    Ok(())
}
