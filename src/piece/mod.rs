mod manager;
mod picker;

pub use manager::{PieceManager, SessionId};
pub use picker::{PieceSelector, RarestFirst, SelectionStrategy, Sequential};

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// State of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// No blocks held
    Missing,
    /// Some blocks received, not yet verified
    InProgress,
    /// Hash checked and handed off for writing
    Verified,
}

/// Result of handing one received block to the piece manager
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Piece still waiting on other blocks
    InProgress,
    /// Piece complete and hash-checked; carries the piece bytes for the writer
    Verified(Vec<u8>),
    /// Piece complete but corrupt; it is back to `Missing`
    HashMismatch,
    /// Piece was already verified; the block was dropped
    Redundant,
}
