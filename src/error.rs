use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    Bencode(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Tracker error: {0}")]
    Tracker(String),

    /// Transport-level failure reaching a peer; retried under the dial policy.
    #[error("Failed to connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    /// The remote answered for a different torrent (or a different protocol).
    #[error("Handshake mismatch with {addr}: {reason}")]
    HandshakeMismatch { addr: SocketAddr, reason: String },

    /// Malformed message stream or I/O failure on an established session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session with {0} is closed")]
    SessionClosed(SocketAddr),

    /// Local filesystem failure while laying out or writing verified output.
    #[error("IO failure on {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download stalled with {verified}/{total} pieces verified")]
    DownloadStalled { verified: usize, total: usize },

    #[error("Download interrupted with {verified}/{total} pieces verified")]
    Interrupted { verified: usize, total: usize },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(String),
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParse(err.to_string())
    }
}

impl BittorrentError {
    /// Whether a failed dial is worth another attempt against the same address.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BittorrentError::Connect { .. })
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
