use crate::segment::piece::PieceStorage;
use crate::segment::selector::{select_piece, SelectorKind};
use crate::segment::Segment;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Minimum bytes each half keeps when stealing the tail of an active segment.
pub const ENDGAME_MIN_SPLIT: u64 = 256 * 1024;

const DEFAULT_MAX_PIECES_PER_SEGMENT: usize = 20;

/// Snapshot of an active segment handed to a worker. Refresh with
/// [`SegmentManager::claim`] before each attempt: `written` advances with
/// progress and `length` can shrink when an endgame thief splits the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentClaim {
    pub index: u64,
    pub position: u64,
    pub length: u64,
    pub written: u64,
}

impl SegmentClaim {
    fn from_segment(seg: &Segment) -> Self {
        Self {
            index: seg.index,
            position: seg.position,
            length: seg.length,
            written: seg.written,
        }
    }
}

struct ManagerState {
    active: HashMap<u64, Segment>,
    next_index: u64,
}

/// Allocates segments to workers. All public operations serialize on one
/// internal lock; workers never see a piece owned by two segments at once.
pub struct SegmentManager {
    storage: Arc<PieceStorage>,
    selector: SelectorKind,
    max_pieces_per_segment: usize,
    state: Mutex<ManagerState>,
}

impl SegmentManager {
    pub fn new(storage: Arc<PieceStorage>, max_pieces: u32, selector: SelectorKind) -> Self {
        let max_pieces_per_segment = if max_pieces == 0 {
            DEFAULT_MAX_PIECES_PER_SEGMENT
        } else {
            max_pieces as usize
        };
        Self {
            storage,
            selector,
            max_pieces_per_segment,
            state: Mutex::new(ManagerState {
                active: HashMap::new(),
                next_index: 0,
            }),
        }
    }

    pub fn storage(&self) -> &Arc<PieceStorage> {
        &self.storage
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn piece_span(&self, seg: &Segment) -> (usize, usize) {
        let piece_length = self.storage.piece_length();
        let start = (seg.position / piece_length) as usize;
        let end = ((seg.position + seg.length - 1) / piece_length) as usize;
        (start, end)
    }

    /// Picks the next segment for a worker: a fresh run of missing pieces
    /// when one exists, otherwise an endgame steal from the active segment
    /// with the most bytes left. None means the manager is drained.
    pub fn get_segment(&self) -> Option<SegmentClaim> {
        let mut state = self.lock();

        let mut active_pieces = HashSet::new();
        for seg in state.active.values() {
            let (start, end) = self.piece_span(seg);
            active_pieces.extend(start..=end);
        }

        if let Some(start) = select_piece(self.selector, &self.storage, &active_pieces) {
            let mut end = start;
            for i in start + 1..self.storage.num_pieces() {
                if i - start >= self.max_pieces_per_segment
                    || self.storage.has_piece(i)
                    || active_pieces.contains(&i)
                {
                    break;
                }
                end = i;
            }

            let position = start as u64 * self.storage.piece_length();
            let length: u64 = (start..=end)
                .filter_map(|i| self.storage.piece(i))
                .map(|p| p.length)
                .sum();

            let index = state.next_index;
            state.next_index += 1;
            let seg = Segment::new(index, position, length);
            let claim = SegmentClaim::from_segment(&seg);
            state.active.insert(index, seg);
            return Some(claim);
        }

        // Endgame: steal the tail of the segment with the most remaining
        // bytes. Map iteration order breaks ties arbitrarily.
        let best = state
            .active
            .values()
            .max_by_key(|seg| seg.remaining())
            .map(|seg| seg.index)?;
        let index = state.next_index;
        let stolen = state
            .active
            .get_mut(&best)
            .and_then(|seg| seg.split(ENDGAME_MIN_SPLIT))?;
        state.next_index += 1;
        let mut stolen = stolen;
        stolen.index = index;
        let claim = SegmentClaim::from_segment(&stolen);
        state.active.insert(index, stolen);
        Some(claim)
    }

    /// Re-reads the live state of an active segment.
    pub fn claim(&self, index: u64) -> Option<SegmentClaim> {
        self.lock().active.get(&index).map(SegmentClaim::from_segment)
    }

    /// Records `n` newly written bytes. Returns true once the segment is
    /// complete so the owning worker can stop reading.
    pub fn update_segment(&self, index: u64, n: u64) -> bool {
        let mut state = self.lock();
        match state.active.get_mut(&index) {
            Some(seg) => {
                seg.advance(n);
                seg.complete
            }
            None => false,
        }
    }

    /// Promotes every piece the segment covers to the bitfield and retires
    /// the segment. Must only be called after all of its bytes hit the disk
    /// adapter.
    pub fn complete_segment(&self, index: u64) {
        let mut state = self.lock();
        let Some(seg) = state.active.remove(&index) else {
            return;
        };
        let (start, end) = self.piece_span(&seg);
        for i in start..=end {
            self.storage.complete_piece(i);
        }
    }

    /// Returns the segment's pieces to the pool without touching the
    /// bitfield. Partially written bytes are re-requested by whoever picks
    /// the range up next.
    pub fn cancel_segment(&self, index: u64) {
        self.lock().active.remove(&index);
    }

    pub fn is_all_complete(&self) -> bool {
        self.storage.is_all_set()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Snapshot of all active segments, used by coverage assertions in tests.
    pub fn active_segments(&self) -> Vec<SegmentClaim> {
        self.lock()
            .active
            .values()
            .map(SegmentClaim::from_segment)
            .collect()
    }
}
