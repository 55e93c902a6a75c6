use crate::segment::piece::PieceStorage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Strategy for picking the next piece to start a segment from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    #[default]
    InOrder,
    Random,
}

impl SelectorKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inorder" | "in-order" => Some(Self::InOrder),
            "random" => Some(Self::Random),
            _ => None,
        }
    }
}

/// Returns a missing piece that no active segment covers, or None when every
/// missing piece is already assigned (endgame).
pub(crate) fn select_piece(
    kind: SelectorKind,
    storage: &PieceStorage,
    active: &HashSet<usize>,
) -> Option<usize> {
    match kind {
        SelectorKind::InOrder => {
            (0..storage.num_pieces()).find(|&i| !storage.has_piece(i) && !active.contains(&i))
        }
        SelectorKind::Random => {
            let candidates: Vec<usize> = (0..storage.num_pieces())
                .filter(|&i| !storage.has_piece(i) && !active.contains(&i))
                .collect();
            if candidates.is_empty() {
                return None;
            }
            let mut raw = [0u8; 8];
            // On entropy failure fall back to the lowest candidate.
            let pick = match getrandom::getrandom(&mut raw) {
                Ok(()) => (u64::from_le_bytes(raw) % candidates.len() as u64) as usize,
                Err(_) => 0,
            };
            Some(candidates[pick])
        }
    }
}
