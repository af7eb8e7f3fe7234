use super::{BlockOutcome, PieceSelector, PieceState, BLOCK_SIZE};
use crate::error::{BittorrentError, Result};
use crate::hash::{self, Sha1Hash};
use crate::peer::{Bitfield, BlockRequest};
use crate::torrent::Descriptor;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Identifies the session a block reservation belongs to
pub type SessionId = u64;

/// Shared download state: per-piece buffers plus the pool of in-flight blocks.
///
/// Lock order is `scheduler` then a single piece; a piece lock is never held
/// while taking `scheduler`.
pub struct PieceManager {
    pieces: Vec<Mutex<Piece>>,
    scheduler: Mutex<Scheduler>,
    selector: Box<dyn PieceSelector>,
    verified: AtomicUsize,
}

struct Piece {
    index: u32,
    length: u32,
    expected_hash: Sha1Hash,
    state: PieceState,
    /// Allocated on the first block, released on verification or reset
    buffer: Vec<u8>,
    blocks_received: HashSet<u32>,
    /// Bumped on every reset, so a stale hash failure cannot reset twice
    generation: u64,
}

struct Scheduler {
    /// Blocks currently requested from some session, and which one
    in_flight: HashMap<BlockRequest, SessionId>,
    /// Number of connected peers offering each piece
    availability: Vec<u32>,
}

impl Piece {
    fn num_blocks(&self) -> u32 {
        self.length.div_ceil(BLOCK_SIZE)
    }

    fn block(&self, block_index: u32) -> BlockRequest {
        let offset = block_index * BLOCK_SIZE;
        BlockRequest::new(self.index, offset, BLOCK_SIZE.min(self.length - offset))
    }

    fn blocks(&self) -> impl Iterator<Item = BlockRequest> + '_ {
        (0..self.num_blocks()).map(move |i| self.block(i))
    }

    /// A received block must line up exactly with one of our block slots
    fn check_block(&self, offset: u32, len: usize) -> Result<()> {
        let aligned = offset % BLOCK_SIZE == 0 && offset < self.length;
        if !aligned || self.block(offset / BLOCK_SIZE).length as usize != len {
            return Err(BittorrentError::Protocol(format!(
                "Block ({}, {}, {} bytes) does not fit piece of {} bytes",
                self.index, offset, len, self.length
            )));
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.state = PieceState::Missing;
        self.buffer = Vec::new();
        self.blocks_received.clear();
    }
}

impl PieceManager {
    pub fn new(descriptor: &Descriptor, selector: Box<dyn PieceSelector>) -> Self {
        let pieces: Vec<_> = descriptor
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                Mutex::new(Piece {
                    index: index as u32,
                    length: descriptor.piece_len(index) as u32,
                    expected_hash: *hash,
                    state: PieceState::Missing,
                    buffer: Vec::new(),
                    blocks_received: HashSet::new(),
                    generation: 0,
                })
            })
            .collect();

        let scheduler = Scheduler {
            in_flight: HashMap::new(),
            availability: vec![0; pieces.len()],
        };

        Self {
            pieces,
            scheduler: Mutex::new(scheduler),
            selector,
            verified: AtomicUsize::new(0),
        }
    }

    /// Reserve up to `max_count` blocks the peer can serve for `owner`.
    ///
    /// Only blocks that are neither received nor in flight elsewhere are
    /// returned; pieces are visited in the selector's priority order.
    pub fn next_needed_blocks(
        &self,
        peer: &Bitfield,
        max_count: usize,
        owner: SessionId,
    ) -> Vec<BlockRequest> {
        let mut blocks = Vec::new();
        if max_count == 0 {
            return blocks;
        }

        let mut scheduler = self.scheduler.lock();

        let mut candidates: Vec<usize> = peer
            .iter()
            .filter(|&i| {
                self.pieces
                    .get(i)
                    .is_some_and(|p| p.lock().state != PieceState::Verified)
            })
            .collect();
        self.selector
            .prioritize(&mut candidates, &scheduler.availability);

        for index in candidates {
            let piece = self.pieces[index].lock();
            if piece.state == PieceState::Verified {
                continue;
            }

            for block in piece.blocks() {
                if piece.blocks_received.contains(&block.offset)
                    || scheduler.in_flight.contains_key(&block)
                {
                    continue;
                }

                scheduler.in_flight.insert(block, owner);
                blocks.push(block);
                if blocks.len() == max_count {
                    return blocks;
                }
            }
        }

        blocks
    }

    /// Return `owner`'s reservations to the pool; returns how many were released
    pub fn release<I>(&self, owner: SessionId, blocks: I) -> usize
    where
        I: IntoIterator<Item = BlockRequest>,
    {
        let mut scheduler = self.scheduler.lock();
        blocks
            .into_iter()
            .filter(|block| {
                if scheduler.in_flight.get(block) == Some(&owner) {
                    scheduler.in_flight.remove(block);
                    true
                } else {
                    false
                }
            })
            .count()
    }

    /// Store a received block and verify the piece once every block is in.
    ///
    /// Re-delivering a block overwrites it in place. A block that does not
    /// line up with the piece geometry is a protocol violation by the sender.
    pub fn on_block_delivered(
        &self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockOutcome> {
        let slot = self.pieces.get(piece_index as usize).ok_or_else(|| {
            BittorrentError::Protocol(format!("Piece index {} out of range", piece_index))
        })?;

        let (outcome, generation) = {
            let mut piece = slot.lock();
            piece.check_block(offset, data.len())?;

            let outcome = if piece.state == PieceState::Verified {
                BlockOutcome::Redundant
            } else {
                if piece.state == PieceState::Missing {
                    piece.state = PieceState::InProgress;
                    piece.buffer = vec![0u8; piece.length as usize];
                }

                let start = offset as usize;
                piece.buffer[start..start + data.len()].copy_from_slice(data);
                piece.blocks_received.insert(offset);

                if piece.blocks_received.len() < piece.num_blocks() as usize {
                    BlockOutcome::InProgress
                } else if hash::verify(&piece.buffer, &piece.expected_hash) {
                    piece.state = PieceState::Verified;
                    piece.blocks_received.clear();
                    self.verified.fetch_add(1, Ordering::SeqCst);
                    info!("Piece {} verified", piece_index);
                    BlockOutcome::Verified(std::mem::take(&mut piece.buffer))
                } else {
                    // Every block stays received until the reset below, so
                    // nothing of this piece can be scheduled in between
                    BlockOutcome::HashMismatch
                }
            };
            (outcome, piece.generation)
        };

        let mut scheduler = self.scheduler.lock();
        scheduler
            .in_flight
            .remove(&BlockRequest::new(piece_index, offset, data.len() as u32));
        if outcome == BlockOutcome::HashMismatch {
            // Reset and drop stale reservations under both locks
            let mut piece = slot.lock();
            if piece.generation == generation && piece.state != PieceState::Verified {
                warn!("Piece {} failed verification, re-queueing", piece_index);
                piece.reset();
                scheduler
                    .in_flight
                    .retain(|block, _| block.piece_index != piece_index);
            }
        }

        debug!(
            "Block ({}, {}) delivered: {:?}",
            piece_index,
            offset,
            match &outcome {
                BlockOutcome::Verified(_) => "verified",
                BlockOutcome::InProgress => "in progress",
                BlockOutcome::HashMismatch => "hash mismatch",
                BlockOutcome::Redundant => "redundant",
            }
        );

        Ok(outcome)
    }

    /// Count a newly connected peer's pieces toward availability
    pub fn add_availability(&self, bitfield: &Bitfield) {
        let mut scheduler = self.scheduler.lock();
        for index in bitfield.iter() {
            if let Some(count) = scheduler.availability.get_mut(index) {
                *count += 1;
            }
        }
    }

    /// Undo `add_availability` for a departed or replaced bitfield
    pub fn remove_availability(&self, bitfield: &Bitfield) {
        let mut scheduler = self.scheduler.lock();
        for index in bitfield.iter() {
            if let Some(count) = scheduler.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// A peer announced one more piece
    pub fn add_have(&self, index: usize) {
        if let Some(count) = self.scheduler.lock().availability.get_mut(index) {
            *count += 1;
        }
    }

    pub fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(|p| p.lock().state)
    }

    /// Number of blocks currently reserved by sessions
    pub fn in_flight_count(&self) -> usize {
        self.scheduler.lock().in_flight.len()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.piece_count()
    }
}
