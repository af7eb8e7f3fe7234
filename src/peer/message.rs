use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on a single frame; anything larger is treated as garbage
pub const MAX_FRAME_LEN: usize = 1 << 21;

/// A block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    /// Raw bitfield payload, validated against the piece count by the session
    Bitfield { bitfield: Bytes },
    Request { block: BlockRequest },
    Piece {
        piece_index: u32,
        offset: u32,
        data: Bytes,
    },
    Cancel { block: BlockRequest },
}

impl PeerMessage {
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;

    /// Append the framed message: <length prefix><message ID><payload>
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke => Self::put_header(dst, Self::CHOKE, 0),
            PeerMessage::Unchoke => Self::put_header(dst, Self::UNCHOKE, 0),
            PeerMessage::Interested => Self::put_header(dst, Self::INTERESTED, 0),
            PeerMessage::NotInterested => Self::put_header(dst, Self::NOT_INTERESTED, 0),
            PeerMessage::Have { piece_index } => {
                Self::put_header(dst, Self::HAVE, 4);
                dst.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                Self::put_header(dst, Self::BITFIELD, bitfield.len());
                dst.put_slice(bitfield);
            }
            PeerMessage::Request { block } => {
                Self::put_header(dst, Self::REQUEST, 12);
                Self::put_block(dst, block);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                Self::put_header(dst, Self::PIECE, 8 + data.len());
                dst.put_u32(*piece_index);
                dst.put_u32(*offset);
                dst.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                Self::put_header(dst, Self::CANCEL, 12);
                Self::put_block(dst, block);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn put_header(dst: &mut BytesMut, id: u8, payload_len: usize) {
        dst.reserve(5 + payload_len);
        dst.put_u32((1 + payload_len) as u32);
        dst.put_u8(id);
    }

    fn put_block(dst: &mut BytesMut, block: &BlockRequest) {
        dst.put_u32(block.piece_index);
        dst.put_u32(block.offset);
        dst.put_u32(block.length);
    }

    /// Split one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `src` is left untouched
    /// in that case so the caller can keep appending reads to it.
    pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(BittorrentError::Protocol(format!(
                "Frame of {} bytes exceeds limit",
                length
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(length).freeze();
        Self::decode_body(frame).map(Some)
    }

    fn decode_body(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = body.get_u8();
        let payload_len = body.len();
        let expect_len = |expected: usize| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(BittorrentError::Protocol(format!(
                    "Message {} has {} payload bytes, expected {}",
                    id, payload_len, expected
                )))
            }
        };

        let message = match id {
            Self::CHOKE => expect_len(0).map(|_| PeerMessage::Choke)?,
            Self::UNCHOKE => expect_len(0).map(|_| PeerMessage::Unchoke)?,
            Self::INTERESTED => expect_len(0).map(|_| PeerMessage::Interested)?,
            Self::NOT_INTERESTED => expect_len(0).map(|_| PeerMessage::NotInterested)?,
            Self::HAVE => {
                expect_len(4)?;
                PeerMessage::Have {
                    piece_index: body.get_u32(),
                }
            }
            Self::BITFIELD => PeerMessage::Bitfield { bitfield: body },
            Self::REQUEST => {
                expect_len(12)?;
                PeerMessage::Request {
                    block: Self::get_block(&mut body),
                }
            }
            Self::CANCEL => {
                expect_len(12)?;
                PeerMessage::Cancel {
                    block: Self::get_block(&mut body),
                }
            }
            Self::PIECE => {
                if payload_len < 8 {
                    return Err(BittorrentError::Protocol(
                        "Piece message shorter than its header".to_string(),
                    ));
                }
                let piece_index = body.get_u32();
                let offset = body.get_u32();
                PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                }
            }
            other => {
                return Err(BittorrentError::Protocol(format!(
                    "Unknown message ID: {}",
                    other
                )))
            }
        };

        Ok(message)
    }

    fn get_block(body: &mut Bytes) -> BlockRequest {
        BlockRequest::new(body.get_u32(), body.get_u32(), body.get_u32())
    }
}
