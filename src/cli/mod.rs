use crate::client::{ClientConfig, TorrentClient};
use crate::download::{DownloadConfig, ShutdownHandle};
use crate::error::Result;
use crate::piece::SelectionStrategy;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Parser)]
#[command(name = "bitfetch")]
#[command(about = "Fetch torrent content from a swarm", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a torrent file
    Download {
        /// Path to the .torrent file
        #[arg(short, long)]
        torrent: PathBuf,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: PathBuf,

        /// Port reported to the tracker
        #[arg(short, long, default_value = "6881")]
        port: u16,

        /// Maximum number of peers to connect to
        #[arg(short, long, default_value = "50")]
        max_peers: usize,

        /// Fetch pieces in order instead of rarest first
        #[arg(long)]
        sequential: bool,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrent,
                output,
                port,
                max_peers,
                sequential,
            } => {
                let selection = if *sequential {
                    SelectionStrategy::Sequential
                } else {
                    SelectionStrategy::RarestFirst
                };
                let config = ClientConfig {
                    download_dir: output.clone(),
                    listen_port: *port,
                    max_peers: *max_peers,
                    download: DownloadConfig {
                        selection,
                        ..DownloadConfig::default()
                    },
                };

                let shutdown = ShutdownHandle::new();
                let trigger = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received, stopping download");
                        trigger.shutdown();
                    }
                });

                let client = TorrentClient::new(config);
                client.download(torrent, shutdown).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }

    async fn show_torrent_info(&self, torrent_path: &Path) -> Result<()> {
        let metainfo = crate::torrent::load_torrent_file(torrent_path).await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", metainfo.info.name);
        println!("Tracker: {}", metainfo.announce);
        println!("Total Size: {} bytes", metainfo.info.total_length);
        let pieces = metainfo.info.piece_count();
        println!("Piece Length: {} bytes", metainfo.info.piece_length);
        println!(
            "Number of Pieces: {} (last one {} bytes)",
            pieces,
            metainfo.info.piece_len(pieces.saturating_sub(1))
        );
        println!("Info Hash: {}", metainfo.info_hash_hex());

        if metainfo.info.is_multi_file() {
            println!("\nFiles (saved under {}/):", metainfo.info.name);
        } else {
            println!("\nFile:");
        }

        for (i, file) in metainfo.info.files.iter().enumerate() {
            println!(
                "  {}: {} ({} bytes)",
                i + 1,
                file.path.join("/"),
                file.length
            );
        }

        let trackers = metainfo.tracker_urls();
        if trackers.len() > 1 {
            println!("\nTrackers, in the order they are tried:");
            for tracker in trackers {
                println!("  - {}", tracker);
            }
        }

        Ok(())
    }
}
