mod descriptor;
mod metainfo;

pub use descriptor::{Descriptor, FileEntry};
pub use metainfo::Metainfo;

use crate::error::{BittorrentError, Result};
use std::path::Path;
use tokio::fs;

/// Load and parse a .torrent file
pub async fn load_torrent_file<P: AsRef<Path>>(path: P) -> Result<Metainfo> {
    let path = path.as_ref();
    let data = fs::read(path).await.map_err(|e| {
        BittorrentError::InvalidTorrent(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_torrent(&data)
}

/// Parse torrent data from bytes
pub fn parse_torrent(data: &[u8]) -> Result<Metainfo> {
    Metainfo::from_bytes(data)
}
