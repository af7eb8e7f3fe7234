//! Fixtures shared by unit tests: descriptors built from in-memory content
//! and a minimal seeding peer on the loopback interface.

use crate::hash::{self, Sha1Hash};
use crate::peer::{Bitfield, BlockRequest, Handshake, PeerMessage, HANDSHAKE_LEN};
use crate::torrent::{Descriptor, FileEntry};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub fn piece_hashes(data: &[u8], piece_length: u64) -> Vec<Sha1Hash> {
    data.chunks(piece_length as usize).map(hash::digest).collect()
}

/// Single file named `content.bin` holding `data`
pub fn descriptor_for(data: &[u8], piece_length: u64) -> Descriptor {
    Descriptor::single_file(
        "content.bin".to_string(),
        piece_length,
        piece_hashes(data, piece_length),
        data.len() as u64,
    )
    .unwrap()
}

/// `data` split into files `<name>/f0`, `<name>/f1`, ... of the given lengths
pub fn multi_file_descriptor(
    name: &str,
    data: &[u8],
    piece_length: u64,
    lengths: &[u64],
) -> Descriptor {
    assert_eq!(lengths.iter().sum::<u64>(), data.len() as u64);
    let files = lengths
        .iter()
        .enumerate()
        .map(|(i, &length)| FileEntry {
            path: vec![name.to_string(), format!("f{}", i)],
            length,
        })
        .collect();

    Descriptor::new(
        name.to_string(),
        piece_length,
        piece_hashes(data, piece_length),
        files,
    )
    .unwrap()
}

/// Stand-in info-hash; only has to be stable per descriptor
pub fn info_hash_for(descriptor: &Descriptor) -> Sha1Hash {
    let concatenated: Vec<u8> = descriptor
        .piece_hashes
        .iter()
        .flat_map(|h| h.as_bytes().to_vec())
        .collect();
    hash::digest(&concatenated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederBehavior {
    /// Serves every request correctly
    Honest,
    /// Announces everything, unchokes, then never answers
    Silent,
    /// Greets with another torrent's info-hash
    WrongInfoHash,
    /// Flips the bytes of its first block on each connection, then behaves
    CorruptFirst,
    /// Chokes right after the first request, then unchokes and serves
    ChokeOnce,
}

/// A seeding peer accepting any number of connections
pub struct FakeSeeder {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FakeSeeder {
    pub async fn start(
        data: &[u8],
        piece_length: u64,
        info_hash: Sha1Hash,
        behavior: SeederBehavior,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let content = Arc::new(data.to_vec());

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let content = content.clone();
                tokio::spawn(async move {
                    // Errors just end this connection
                    let _ = serve(stream, content, piece_length, info_hash, behavior).await;
                });
            }
        });

        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FakeSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    content: Arc<Vec<u8>>,
    piece_length: u64,
    info_hash: Sha1Hash,
    behavior: SeederBehavior,
) -> std::io::Result<()> {
    let mut greeting = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut greeting).await?;

    let advertised = if behavior == SeederBehavior::WrongInfoHash {
        hash::digest(b"some other torrent")
    } else {
        info_hash
    };
    stream
        .write_all(&Handshake::new(advertised, *b"-FS0001-seedseedseed").to_bytes())
        .await?;

    let num_pieces = content.len().div_ceil(piece_length as usize);
    let mut out = BytesMut::new();
    PeerMessage::Bitfield {
        bitfield: Bytes::copy_from_slice(Bitfield::full(num_pieces).as_bytes()),
    }
    .encode(&mut out);
    PeerMessage::Unchoke.encode(&mut out);
    stream.write_all(&out).await?;

    let mut corrupt_next = behavior == SeederBehavior::CorruptFirst;
    let mut choke_next = behavior == SeederBehavior::ChokeOnce;
    let mut buf = BytesMut::new();
    loop {
        let message = match PeerMessage::decode_frame(&mut buf) {
            Ok(Some(message)) => message,
            Ok(None) => {
                if stream.read_buf(&mut buf).await? == 0 {
                    return Ok(());
                }
                continue;
            }
            Err(_) => return Ok(()),
        };

        let PeerMessage::Request { block } = message else {
            continue;
        };
        if behavior == SeederBehavior::Silent {
            continue;
        }
        if choke_next {
            // Drop this request the way a choking peer would
            choke_next = false;
            let mut out = BytesMut::new();
            PeerMessage::Choke.encode(&mut out);
            PeerMessage::Unchoke.encode(&mut out);
            stream.write_all(&out).await?;
            continue;
        }

        let mut data = block_bytes(&content, piece_length, block).to_vec();
        if corrupt_next {
            corrupt_next = false;
            data.iter_mut().for_each(|b| *b = !*b);
        }
        let reply = PeerMessage::Piece {
            piece_index: block.piece_index,
            offset: block.offset,
            data: Bytes::from(data),
        };
        stream.write_all(&reply.to_bytes()).await?;
    }
}

fn block_bytes(content: &[u8], piece_length: u64, block: BlockRequest) -> &[u8] {
    let start = (block.piece_index as u64 * piece_length + block.offset as u64) as usize;
    let end = (start + block.length as usize).min(content.len());
    &content[start.min(end)..end]
}
