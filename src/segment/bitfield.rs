use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Error restoring a bitfield from its hex serialization. The length check is
/// strict so geometry drift between the control file and the live download is
/// caught instead of silently truncated.
#[derive(Debug, PartialEq, Eq)]
pub enum BitfieldHexError {
    Length { got: usize, expected: usize },
    Digit { position: usize },
}

impl std::fmt::Display for BitfieldHexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Length { got, expected } => write!(
                f,
                "hex bitfield length mismatch: got {got} chars, expected {expected}"
            ),
            Self::Digit { position } => write!(f, "invalid hex digit at position {position}"),
        }
    }
}

impl std::error::Error for BitfieldHexError {}

struct BitfieldState {
    bits: Vec<u8>,
    ones: usize,
}

/// Thread-safe packed bit array over piece indices. Bits are MSB-first within
/// each byte, matching the hex serialization in the control file. Out-of-range
/// operations are no-ops returning false.
pub struct Bitfield {
    num_pieces: usize,
    state: RwLock<BitfieldState>,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            num_pieces,
            state: RwLock::new(BitfieldState {
                bits: vec![0u8; num_pieces.div_ceil(8)],
                ones: 0,
            }),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    fn read(&self) -> RwLockReadGuard<'_, BitfieldState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BitfieldState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sets the bit; returns whether it changed.
    pub fn set(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let mut state = self.write();
        let mask = 1u8 << (7 - (index % 8));
        if state.bits[index / 8] & mask == 0 {
            state.bits[index / 8] |= mask;
            state.ones += 1;
            return true;
        }
        false
    }

    /// Clears the bit; returns whether it changed.
    pub fn unset(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let mut state = self.write();
        let mask = 1u8 << (7 - (index % 8));
        if state.bits[index / 8] & mask != 0 {
            state.bits[index / 8] &= !mask;
            state.ones -= 1;
            return true;
        }
        false
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let state = self.read();
        state.bits[index / 8] & (1u8 << (7 - (index % 8))) != 0
    }

    pub fn first_missing(&self, from: usize) -> Option<usize> {
        let state = self.read();
        (from..self.num_pieces).find(|&i| state.bits[i / 8] & (1u8 << (7 - (i % 8))) == 0)
    }

    pub fn first_set(&self, from: usize) -> Option<usize> {
        let state = self.read();
        (from..self.num_pieces).find(|&i| state.bits[i / 8] & (1u8 << (7 - (i % 8))) != 0)
    }

    pub fn count(&self) -> usize {
        self.read().ones
    }

    pub fn count_missing(&self) -> usize {
        self.num_pieces - self.read().ones
    }

    pub fn is_all_set(&self) -> bool {
        self.count() == self.num_pieces
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.bits.fill(0);
        state.ones = 0;
    }

    pub fn set_all(&self) {
        let mut state = self.write();
        state.bits.fill(0xff);
        if self.num_pieces % 8 != 0 {
            // Keep padding bits in the tail byte clear.
            let last = state.bits.len() - 1;
            state.bits[last] = 0xffu8 << (8 - self.num_pieces % 8);
        }
        state.ones = self.num_pieces;
    }

    /// Lowercase hex, `ceil(num_pieces / 8)` bytes wide. Padding bits in the
    /// tail byte serialize as zero.
    pub fn to_hex(&self) -> String {
        let state = self.read();
        let mut out = String::with_capacity(state.bits.len() * 2);
        for b in &state.bits {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// Restores from `to_hex` output. The input must be exactly
    /// `2 * ceil(num_pieces / 8)` valid hex characters; on failure the
    /// bitfield resets to all-zero. Bits beyond `num_pieces` do not count.
    pub fn from_hex(&self, hex: &str) -> Result<(), BitfieldHexError> {
        let mut state = self.write();
        let expected = state.bits.len() * 2;
        if hex.len() != expected {
            return Err(BitfieldHexError::Length {
                got: hex.len(),
                expected,
            });
        }

        let mut decoded = Vec::with_capacity(state.bits.len());
        for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok());
            match pair {
                Some(b) => decoded.push(b),
                None => {
                    state.bits.fill(0);
                    state.ones = 0;
                    return Err(BitfieldHexError::Digit { position: i * 2 });
                }
            }
        }

        let mut ones = 0usize;
        for i in 0..self.num_pieces {
            if decoded[i / 8] & (1u8 << (7 - (i % 8))) != 0 {
                ones += 1;
            }
        }
        state.bits = decoded;
        state.ones = ones;
        Ok(())
    }

    /// One char per piece, `1` for complete. Debug aid.
    pub fn to_binary(&self) -> String {
        let state = self.read();
        (0..self.num_pieces)
            .map(|i| {
                if state.bits[i / 8] & (1u8 << (7 - (i % 8))) != 0 {
                    '1'
                } else {
                    '0'
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitfield")
            .field("num_pieces", &self.num_pieces)
            .field("set", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_unset_report_changes() {
        let b = Bitfield::new(10);
        assert!(b.set(3));
        assert!(!b.set(3));
        assert!(b.has(3));
        assert_eq!(b.count(), 1);
        assert!(b.unset(3));
        assert!(!b.unset(3));
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn out_of_range_ops_are_noops() {
        let b = Bitfield::new(4);
        assert!(!b.set(4));
        assert!(!b.set(100));
        assert!(!b.unset(4));
        assert!(!b.has(4));
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn first_missing_and_first_set_walk_from_start() {
        let b = Bitfield::new(10);
        b.set(0);
        b.set(1);
        b.set(5);
        assert_eq!(b.first_missing(0), Some(2));
        assert_eq!(b.first_missing(5), Some(6));
        assert_eq!(b.first_set(2), Some(5));
        assert_eq!(b.first_set(6), None);
        b.set_all();
        assert_eq!(b.first_missing(0), None);
    }

    #[test]
    fn set_all_and_clear_track_count() {
        let b = Bitfield::new(13);
        b.set_all();
        assert!(b.is_all_set());
        assert_eq!(b.count(), 13);
        assert_eq!(b.count_missing(), 0);
        b.clear();
        assert_eq!(b.count(), 0);
        assert_eq!(b.count_missing(), 13);
    }

    #[test]
    fn hex_round_trip_restores_every_bit() {
        let b = Bitfield::new(21);
        for i in [0, 3, 7, 8, 15, 20] {
            b.set(i);
        }
        let hex = b.to_hex();
        assert_eq!(hex.len(), 2 * 21usize.div_ceil(8));

        let restored = Bitfield::new(21);
        restored.from_hex(&hex).expect("valid hex");
        assert_eq!(restored.to_binary(), b.to_binary());
        assert_eq!(restored.count(), 6);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let b = Bitfield::new(9);
        assert_eq!(
            b.from_hex("ff"),
            Err(BitfieldHexError::Length {
                got: 2,
                expected: 4
            })
        );
    }

    #[test]
    fn from_hex_rejects_bad_digits_and_resets() {
        let b = Bitfield::new(8);
        b.set(0);
        assert_eq!(b.from_hex("zz"), Err(BitfieldHexError::Digit { position: 0 }));
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn padding_bits_do_not_count() {
        // 4 pieces in one byte; set the low nibble of the serialized byte.
        let b = Bitfield::new(4);
        b.from_hex("ff").expect("valid hex");
        assert_eq!(b.count(), 4);
        assert!(b.is_all_set());
    }

    #[test]
    fn concurrent_sets_keep_count_consistent() {
        let b = std::sync::Arc::new(Bitfield::new(1000));
        let mut handles = Vec::new();
        for t in 0..4 {
            let b = b.clone();
            handles.push(std::thread::spawn(move || {
                for i in (t..1000).step_by(4) {
                    b.set(i);
                }
            }));
        }
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(b.count(), 1000);
        assert!(b.is_all_set());
    }
}
