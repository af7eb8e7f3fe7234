use crate::error::{BittorrentError, Result};
use crate::hash::Sha1Hash;

/// One file of the torrent's content, in layout order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the output directory
    pub path: Vec<String>,
    pub length: u64,
}

/// Immutable description of the content being downloaded.
///
/// Pieces partition the concatenation of `files` in order: piece `i` covers
/// bytes `[i * piece_length, min((i + 1) * piece_length, total_length))`.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Suggested name for the file or directory
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<Sha1Hash>,
    pub total_length: u64,
    pub files: Vec<FileEntry>,
}

impl Descriptor {
    pub fn new(
        name: String,
        piece_length: u64,
        piece_hashes: Vec<Sha1Hash>,
        files: Vec<FileEntry>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(invalid("Piece length must be positive"));
        }
        if piece_length > u32::MAX as u64 {
            return Err(invalid("Piece length does not fit the wire format"));
        }
        if files.is_empty() {
            return Err(invalid("Torrent has no files"));
        }
        for file in &files {
            validate_path(&file.path)?;
        }

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        if total_length == 0 {
            return Err(invalid("Total length must be positive"));
        }

        let expected_pieces = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(invalid(&format!(
                "Expected {} piece hashes for {} bytes, found {}",
                expected_pieces,
                total_length,
                piece_hashes.len()
            )));
        }
        if expected_pieces > u32::MAX as u64 {
            return Err(invalid("Too many pieces"));
        }

        Ok(Self {
            name,
            piece_length,
            piece_hashes,
            total_length,
            files,
        })
    }

    /// A single-file torrent stored as `<name>` in the output directory
    pub fn single_file(
        name: String,
        piece_length: u64,
        piece_hashes: Vec<Sha1Hash>,
        length: u64,
    ) -> Result<Self> {
        let files = vec![FileEntry {
            path: vec![name.clone()],
            length,
        }];
        Self::new(name, piece_length, piece_hashes, files)
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`; only the last piece may be shorter
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }
}

fn invalid(msg: &str) -> BittorrentError {
    BittorrentError::InvalidTorrent(msg.to_string())
}

/// Reject components that could escape the output directory
fn validate_path(path: &[String]) -> Result<()> {
    if path.is_empty() {
        return Err(invalid("Empty file path"));
    }
    for component in path {
        let bad = component.is_empty()
            || component == "."
            || component == ".."
            || component.contains(['/', '\\', '\0']);
        if bad {
            return Err(invalid(&format!("Unsafe path component {:?}", component)));
        }
    }
    Ok(())
}
