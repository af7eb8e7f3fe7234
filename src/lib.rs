//! Piece acquisition engine for BitTorrent downloads: peer sessions, block
//! scheduling, piece verification and a coordinating control loop.

pub mod bencode;
pub mod cli;
pub mod client;
pub mod download;
pub mod error;
pub mod hash;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use error::{BittorrentError, Result};
