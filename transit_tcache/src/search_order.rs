//! Order in which full lookups visit sectors.
//!
//! Holds exactly the allocated sectors. New sectors go to the back, so
//! untouched sectors are visited oldest first. A sector that satisfies a
//! lookup moves one place toward the front, and a recycled sector (whose
//! contents are now the newest) goes back to the end.

use crate::types::SectorNo;

#[derive(Debug, Default, Clone)]
pub(crate) struct SearchOrder {
    order: Vec<SectorNo>,
}

impl SearchOrder {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn as_slice(&self) -> &[SectorNo] {
        &self.order
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Append a newly allocated sector.
    pub fn push(&mut self, sector: SectorNo) {
        debug_assert!(!self.order.contains(&sector));
        self.order.push(sector);
    }

    /// Move the sector at `pos` one place toward the front.
    #[inline]
    pub fn promote(&mut self, pos: usize) {
        if pos > 0 && pos < self.order.len() {
            self.order.swap(pos - 1, pos);
        }
    }

    /// Move `sector` to the back.
    pub fn demote_to_back(&mut self, sector: SectorNo) {
        if let Some(pos) = self.order.iter().position(|&s| s == sector) {
            self.order.remove(pos);
            self.order.push(sector);
        }
    }

    /// Whether the order is a permutation of `allocated`.
    pub fn is_permutation_of(&self, allocated: &[SectorNo]) -> bool {
        if self.order.len() != allocated.len() {
            return false;
        }
        let mut mine = self.order.clone();
        let mut theirs = allocated.to_vec();
        mine.sort_unstable();
        theirs.sort_unstable();
        mine == theirs && mine.windows(2).all(|w| w[0] != w[1])
    }
}
