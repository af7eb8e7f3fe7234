use anyhow::{Context, Result};
use bitfetch::cli::Cli;
use bitfetch::BittorrentError;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Conventional status for a run stopped by SIGINT
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match Cli::parse().run().await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(BittorrentError::Interrupted { verified, total }) => {
            eprintln!("Interrupted with {}/{} pieces saved", verified, total);
            Ok(ExitCode::from(INTERRUPTED))
        }
        Err(e) => Err(e).context("bitfetch failed"),
    }
}
