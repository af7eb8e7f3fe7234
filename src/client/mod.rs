use crate::download::{self, DownloadConfig, DownloadHooks, Progress, ShutdownHandle};
use crate::error::{BittorrentError, Result};
use crate::torrent::Metainfo;
use crate::tracker::{
    generate_peer_id, TrackerClient, TrackerEvent, TrackerRequest, TrackerResponse,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

/// Trackers asking for shorter intervals are not honored
const MIN_REANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the BitTorrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    /// Port reported to the tracker
    pub listen_port: u16,
    pub max_peers: usize,
    pub download: DownloadConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: 6881,
            max_peers: 50,
            download: DownloadConfig::default(),
        }
    }
}

/// Main BitTorrent client
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: [u8; 20],
    tracker: TrackerClient,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = generate_peer_id();
        info!("Client initialized with peer_id: {}", hex::encode(peer_id));

        Self {
            config,
            peer_id,
            tracker: TrackerClient::new(),
        }
    }

    /// Download a torrent into the configured directory.
    ///
    /// Peers come from the first tracker that answers; the swarm is
    /// re-announced periodically while the download runs.
    pub async fn download(&self, torrent_path: &Path, shutdown: ShutdownHandle) -> Result<()> {
        info!("Starting download for: {}", torrent_path.display());

        let metainfo = crate::torrent::load_torrent_file(torrent_path).await?;

        info!("Torrent: {}", metainfo.info.name);
        info!("Total size: {} bytes", metainfo.info.total_length);
        info!("Pieces: {}", metainfo.info.piece_count());
        info!("Info hash: {}", metainfo.info_hash_hex());

        let trackers = metainfo.tracker_urls();
        let request = TrackerRequest::new(
            *metainfo.info_hash.as_bytes(),
            self.peer_id,
            self.config.listen_port,
            metainfo.info.total_length,
        );
        let response = announce_any(&self.tracker, &trackers, &request).await?;
        let peers = addresses(&response);
        info!("Received {} peers from tracker", peers.len());

        let (address_tx, address_rx) = mpsc::unbounded_channel();
        let reannounce = tokio::spawn(reannounce(
            self.tracker.clone(),
            trackers.clone(),
            request.clone().with_event(None),
            reannounce_interval(response.interval),
            address_tx,
        ));

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(report_progress(progress_rx));

        let hooks = DownloadHooks {
            progress: Some(progress_tx),
            addresses: Some(address_rx),
            shutdown,
        };
        let result = download::run(
            metainfo.info.clone(),
            metainfo.info_hash,
            peers,
            &self.config.download_dir,
            self.download_config(),
            hooks,
        )
        .await;

        reannounce.abort();
        let _ = reporter.await;
        result?;

        info!(
            "Saved {} under {}",
            metainfo.info.name,
            self.config.download_dir.display()
        );
        self.announce_completed(&metainfo, &trackers, request).await;
        Ok(())
    }

    fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            peer_id: self.peer_id,
            max_sessions: self.config.max_peers,
            ..self.config.download.clone()
        }
    }

    /// Best effort; a tracker that missed it will age us out anyway
    async fn announce_completed(
        &self,
        metainfo: &Metainfo,
        trackers: &[String],
        request: TrackerRequest,
    ) {
        let request = TrackerRequest {
            downloaded: metainfo.info.total_length,
            left: 0,
            ..request.with_event(Some(TrackerEvent::Completed))
        };
        if let Err(e) = announce_any(&self.tracker, trackers, &request).await {
            warn!("Completion announce failed: {}", e);
        }
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

/// Try each tracker in turn; the last error is returned if none answers
async fn announce_any(
    tracker: &TrackerClient,
    urls: &[String],
    request: &TrackerRequest,
) -> Result<TrackerResponse> {
    let mut last_error = BittorrentError::Tracker("No tracker URL".to_string());
    for url in urls {
        match tracker.announce(url, request).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!("Tracker {} failed: {}", url, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

fn addresses(response: &TrackerResponse) -> Vec<SocketAddr> {
    response.peers.iter().map(|peer| peer.addr).collect()
}

fn reannounce_interval(seconds: u64) -> Duration {
    Duration::from_secs(seconds).max(MIN_REANNOUNCE_INTERVAL)
}

/// Feed fresh peer lists to the running download until it hangs up
async fn reannounce(
    tracker: TrackerClient,
    urls: Vec<String>,
    request: TrackerRequest,
    mut interval: Duration,
    feed: mpsc::UnboundedSender<Vec<SocketAddr>>,
) {
    loop {
        sleep(interval).await;

        match announce_any(&tracker, &urls, &request).await {
            Ok(response) => {
                interval = reannounce_interval(response.interval);
                if feed.send(addresses(&response)).is_err() {
                    break;
                }
            }
            Err(e) => warn!("Re-announce failed: {}", e),
        }
    }
}

async fn report_progress(mut progress: mpsc::UnboundedReceiver<Progress>) {
    while let Some(p) = progress.recv().await {
        info!(
            "Progress: {}/{} pieces ({:.1}%)",
            p.verified,
            p.total,
            p.percent()
        );
    }
}
