/// Orders candidate pieces for block scheduling
pub trait PieceSelector: Send + Sync {
    /// Sort `candidates` (piece indices) into request priority order.
    /// `availability[i]` is the number of connected peers offering piece `i`.
    fn prioritize(&self, candidates: &mut [usize], availability: &[u32]);
}

/// Fewest offering peers first, ties broken by ascending index
#[derive(Debug, Default, Clone, Copy)]
pub struct RarestFirst;

impl PieceSelector for RarestFirst {
    fn prioritize(&self, candidates: &mut [usize], availability: &[u32]) {
        candidates.sort_unstable_by_key(|&i| (availability.get(i).copied().unwrap_or(0), i));
    }
}

/// Ascending index, ignoring availability
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl PieceSelector for Sequential {
    fn prioritize(&self, candidates: &mut [usize], _availability: &[u32]) {
        candidates.sort_unstable();
    }
}

/// Configurable choice of built-in selector
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    #[default]
    RarestFirst,
    Sequential,
}

impl SelectionStrategy {
    pub fn selector(self) -> Box<dyn PieceSelector> {
        match self {
            SelectionStrategy::RarestFirst => Box::new(RarestFirst),
            SelectionStrategy::Sequential => Box::new(Sequential),
        }
    }
}
