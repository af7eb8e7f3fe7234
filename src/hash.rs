use crate::error::{BittorrentError, Result};
use sha1::{Digest, Sha1};
use std::fmt;

/// Length in bytes of a SHA-1 digest
pub const HASH_LEN: usize = 20;

/// A 20-byte SHA-1 digest (piece hashes and info-hashes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Hash([u8; HASH_LEN]);

impl Sha1Hash {
    pub fn new(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let hash: [u8; HASH_LEN] = slice.try_into().map_err(|_| {
            BittorrentError::InvalidTorrent(format!(
                "Hash must be {} bytes, got {}",
                HASH_LEN,
                slice.len()
            ))
        })?;
        Ok(Self(hash))
    }

    /// Split a concatenation of digests (the `pieces` field) into hashes
    pub fn split_concatenated(data: &[u8]) -> Result<Vec<Self>> {
        if data.len() % HASH_LEN != 0 {
            return Err(BittorrentError::InvalidTorrent(
                "Pieces length must be multiple of 20".to_string(),
            ));
        }

        data.chunks_exact(HASH_LEN).map(Self::from_slice).collect()
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Sha1Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Sha1Hash {
    fn from(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", self.to_hex())
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// SHA-1 of `data`
pub fn digest(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    Sha1Hash(hasher.finalize().into())
}

/// Whether `data` hashes to `expected`
pub fn verify(data: &[u8], expected: &Sha1Hash) -> bool {
    digest(data) == *expected
}
