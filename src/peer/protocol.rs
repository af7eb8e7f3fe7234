use crate::error::{BittorrentError, Result};
use crate::hash::Sha1Hash;

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received greeting.
    ///
    /// Only the standard protocol identifier is accepted; the caller is
    /// responsible for comparing the info-hash.
    pub fn from_bytes(data: &[u8; HANDSHAKE_LEN]) -> std::result::Result<Self, String> {
        let pstrlen = data[0] as usize;
        if pstrlen != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            return Err("unsupported protocol identifier".to_string());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Handshake {
            reserved,
            info_hash: Sha1Hash::new(info_hash),
            peer_id,
        })
    }

    /// Check the remote greeting belongs to the torrent we are downloading
    pub fn validate(
        data: &[u8; HANDSHAKE_LEN],
        expected: &Sha1Hash,
        addr: std::net::SocketAddr,
    ) -> Result<Self> {
        let handshake = Self::from_bytes(data)
            .map_err(|reason| BittorrentError::HandshakeMismatch { addr, reason })?;

        if handshake.info_hash != *expected {
            return Err(BittorrentError::HandshakeMismatch {
                addr,
                reason: format!("info hash {} does not match", handshake.info_hash),
            });
        }

        Ok(handshake)
    }
}
