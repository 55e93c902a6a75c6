//! File geometry and segment assignment: pieces tile the file, segments are
//! contiguous piece runs owned by one worker at a time, and the bitfield
//! records which pieces finished.

pub mod bitfield;
pub mod manager;
pub mod piece;
pub mod selector;

pub use bitfield::{Bitfield, BitfieldHexError};
pub use manager::{SegmentClaim, SegmentManager, ENDGAME_MIN_SPLIT};
pub use piece::{optimal_piece_length, Piece, PieceStorage, DEFAULT_PIECE_LENGTH, MAX_PIECE_LENGTH};
pub use selector::SelectorKind;

/// A contiguous byte range under download. `position` and `length` are
/// absolute file coordinates; `written` bytes from the start are already on
/// disk. Exactly one worker updates a segment at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: u64,
    pub position: u64,
    pub length: u64,
    pub written: u64,
    pub complete: bool,
}

impl Segment {
    pub fn new(index: u64, position: u64, length: u64) -> Self {
        Self {
            index,
            position,
            length,
            written: 0,
            complete: false,
        }
    }

    /// Records `n` more written bytes, capping at the segment length and
    /// flipping `complete` at the boundary.
    pub fn advance(&mut self, n: u64) {
        self.written = (self.written + n).min(self.length);
        if self.written == self.length {
            self.complete = true;
        }
    }

    pub fn remaining(&self) -> u64 {
        self.length - self.written
    }

    /// Endgame split: halves the remaining bytes, shrinking this segment and
    /// returning a new one that starts right after the shrunk boundary. The
    /// caller assigns the new segment's index. Returns None when the
    /// remainder is too small to be worth stealing.
    pub fn split(&mut self, min_size: u64) -> Option<Segment> {
        let remaining = self.remaining();
        if remaining <= min_size * 2 {
            return None;
        }
        let first_half = remaining / 2;
        let new_length = remaining - first_half;
        self.length -= new_length;
        if self.written == self.length {
            self.complete = true;
        }
        Some(Segment::new(0, self.position + self.length, new_length))
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "seg#{}[{}-{}]({}/{})",
            self.index,
            self.position,
            self.position + self.length,
            self.written,
            self.length
        )
    }
}
