use super::Peer;
use crate::bencode::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::net::IpAddr;

/// Response from a tracker announce
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Suggested seconds to wait before the next announce
    pub interval: u64,
    pub min_interval: Option<u64>,
    /// Number of seeders
    pub complete: Option<u64>,
    /// Number of leechers
    pub incomplete: Option<u64>,
    pub peers: Vec<Peer>,
}

fn tracker_error(msg: &str) -> BittorrentError {
    BittorrentError::Tracker(msg.to_string())
}

impl TrackerResponse {
    pub fn from_bencode(value: BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(tracker_error("Response must be a dict"));
        }

        if let Some(failure) = value.get("failure reason") {
            let reason = failure.as_str().unwrap_or("Unknown failure");
            return Err(tracker_error(reason));
        }

        let interval = value
            .get_u64("interval")
            .ok_or_else(|| tracker_error("Missing 'interval' field"))?;

        let peers_value = value
            .get("peers")
            .ok_or_else(|| tracker_error("Missing 'peers' field"))?;

        let peers = if let Some(compact) = peers_value.as_bytes() {
            Peer::from_compact_list(compact)
        } else if let Some(list) = peers_value.as_list() {
            parse_peer_list(list)?
        } else {
            return Err(tracker_error("Invalid 'peers' format"));
        };

        Ok(TrackerResponse {
            interval,
            min_interval: value.get_u64("min interval"),
            complete: value.get_u64("complete"),
            incomplete: value.get_u64("incomplete"),
            peers,
        })
    }
}

fn parse_peer_list(list: &[BencodeValue]) -> Result<Vec<Peer>> {
    list.iter()
        .map(|entry| {
            let ip: IpAddr = entry
                .get_str("ip")
                .ok_or_else(|| tracker_error("Missing peer 'ip'"))?
                .parse()
                .map_err(|_| tracker_error("Invalid peer IP address"))?;

            let port = entry
                .get_int("port")
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| tracker_error("Missing or invalid peer 'port'"))?;

            let mut peer = Peer::new(ip, port);
            peer.peer_id = entry
                .get("peer id")
                .and_then(|v| v.as_bytes())
                .map(|b| b.to_vec());
            Ok(peer)
        })
        .collect()
}
