use super::{TrackerRequest, TrackerResponse};
use crate::bencode::decode;
use crate::error::{BittorrentError, Result};
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{debug, info};

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for communicating with BitTorrent trackers
#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: Client,
}

impl TrackerClient {
    pub fn new() -> Self {
        // Builder only fails if the TLS backend cannot initialize
        let client = Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Send an announce and get the peer list
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &TrackerRequest,
    ) -> Result<TrackerResponse> {
        info!("Announcing to tracker: {}", tracker_url);

        let url = announce_url(tracker_url, request)?;
        debug!("Tracker request URL: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        debug!(
            "Tracker response status: {}, body length: {}",
            status,
            body.len()
        );

        if !status.is_success() {
            return Err(BittorrentError::Tracker(format!("HTTP error: {}", status)));
        }

        let tracker_response = TrackerResponse::from_bencode(decode(&body)?)?;

        info!(
            "Received {} peers from tracker (interval: {}s)",
            tracker_response.peers.len(),
            tracker_response.interval
        );

        Ok(tracker_response)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

fn announce_url(tracker_url: &str, request: &TrackerRequest) -> Result<Url> {
    let mut url = Url::parse(tracker_url)?;
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => {
            format!("{}&{}", existing, request.query_string())
        }
        _ => request.query_string(),
    };
    url.set_query(Some(&query));
    Ok(url)
}
