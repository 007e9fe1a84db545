//! Per-tile flag grid backed by a bit vector.

use bitvec::vec::BitVec;

use crate::TileIndex;

/// One bit per tile of a grid. Out-of-range reads return false and
/// out-of-range writes are ignored, so callers holding indices from a
/// previous grid size never panic.
#[derive(Debug, Clone)]
pub struct TileBitset {
    across: u32,
    down: u32,
    bits: BitVec,
}

impl TileBitset {
    pub fn new(across: u32, down: u32) -> Self {
        Self {
            across,
            down,
            bits: BitVec::repeat(false, (across as usize) * (down as usize)),
        }
    }

    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    fn position(&self, index: TileIndex) -> Option<usize> {
        if index.i >= self.across || index.j >= self.down {
            return None;
        }
        Some((index.j as usize) * (self.across as usize) + index.i as usize)
    }

    pub fn set(&mut self, index: TileIndex) {
        if let Some(position) = self.position(index) {
            self.bits.set(position, true);
        }
    }

    pub fn unset(&mut self, index: TileIndex) {
        if let Some(position) = self.position(index) {
            self.bits.set(position, false);
        }
    }

    pub fn get(&self, index: TileIndex) -> bool {
        self.position(index)
            .is_some_and(|position| self.bits[position])
    }

    pub fn any(&self) -> bool {
        self.bits.any()
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn iter_set(&self) -> impl Iterator<Item = TileIndex> + '_ {
        let across = self.across as usize;
        self.bits.iter_ones().map(move |position| TileIndex {
            i: (position % across) as u32,
            j: (position / across) as u32,
        })
    }
}
