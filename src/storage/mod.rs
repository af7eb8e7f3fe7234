use crate::error::{BittorrentError, Result};
use crate::torrent::Descriptor;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Writes verified pieces into the torrent's file layout
pub struct StorageManager {
    files: Vec<FileSlot>,
    piece_length: u64,
}

#[derive(Debug)]
struct FileSlot {
    path: PathBuf,
    length: u64,
    /// Offset of the file's first byte in the concatenated content
    offset: u64,
}

/// Part of a piece that lands in one file
#[derive(Debug, PartialEq, Eq)]
struct Segment {
    file: usize,
    file_offset: u64,
    data: Range<usize>,
}

fn storage_error(path: &Path, source: std::io::Error) -> BittorrentError {
    BittorrentError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

impl StorageManager {
    /// Create every file of the layout under `output_dir`, sized to its
    /// declared length
    pub async fn new<P: AsRef<Path>>(output_dir: P, descriptor: &Descriptor) -> Result<Self> {
        let output_dir = output_dir.as_ref();

        let mut files = Vec::with_capacity(descriptor.files.len());
        let mut offset = 0u64;

        for entry in &descriptor.files {
            let path: PathBuf = entry
                .path
                .iter()
                .fold(output_dir.to_path_buf(), |path, component| path.join(component));

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| storage_error(parent, e))?;
            }

            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .await
                .map_err(|e| storage_error(&path, e))?;
            file.set_len(entry.length)
                .await
                .map_err(|e| storage_error(&path, e))?;

            files.push(FileSlot {
                path,
                length: entry.length,
                offset,
            });
            offset += entry.length;
        }

        info!(
            "Storage initialized: {} files, {} bytes total under {}",
            files.len(),
            descriptor.total_length,
            output_dir.display()
        );

        Ok(Self {
            files,
            piece_length: descriptor.piece_length,
        })
    }

    /// Write a verified piece, splitting it across file boundaries
    pub async fn write_verified_piece(&self, piece_index: u32, data: &[u8]) -> Result<()> {
        let global_offset = piece_index as u64 * self.piece_length;

        for segment in self.segments(global_offset, data.len()) {
            let slot = &self.files[segment.file];

            let mut file = OpenOptions::new()
                .write(true)
                .open(&slot.path)
                .await
                .map_err(|e| storage_error(&slot.path, e))?;

            let write = async {
                file.seek(SeekFrom::Start(segment.file_offset)).await?;
                file.write_all(&data[segment.data.clone()]).await?;
                file.flush().await
            };
            write.await.map_err(|e| storage_error(&slot.path, e))?;

            debug!(
                "Wrote {} bytes of piece {} to {} at offset {}",
                segment.data.len(),
                piece_index,
                slot.path.display(),
                segment.file_offset
            );
        }

        Ok(())
    }

    /// Paths of the layout's files, in order
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(|f| f.path.as_path())
    }

    /// Map `[offset, offset + len)` of the content onto per-file segments
    fn segments(&self, offset: u64, len: usize) -> Vec<Segment> {
        let end = offset + len as u64;

        self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.offset < end && offset < f.offset + f.length)
            .map(|(index, f)| {
                let start = offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                Segment {
                    file: index,
                    file_offset: start - f.offset,
                    data: (start - offset) as usize..(stop - offset) as usize,
                }
            })
            .collect()
    }
}
