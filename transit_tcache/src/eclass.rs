//! Equivalence classes: a coarse spatial index over guest code.
//!
//! The guest address space is cut into aligned windows of
//! `2^ECLASS_SHIFT` bytes and windows are folded onto `ECLASS_WIDTH` bits
//! of class number. An extent that stays inside one window belongs to that
//! window's class; an extent that crosses a boundary goes into the
//! catch-all [`ECLASS_MISC`] class. Range invalidation then only has to
//! visit the class of the range plus the miscellaneous class.
//!
//! Folding means unrelated windows share a class, so membership is only
//! a candidate filter. Callers always finish with a precise overlap test.

use smallvec::SmallVec;

use crate::types::{GuestAddr, GuestExtent};

/// log2 of the window size.
pub const ECLASS_SHIFT: u32 = 13;
/// Bits of window number kept in the class number.
pub const ECLASS_WIDTH: u32 = 9;
/// Class for extents that cross a window boundary.
pub const ECLASS_MISC: u16 = 1 << ECLASS_WIDTH;
/// Number of classes including the miscellaneous one.
pub const ECLASS_COUNT: usize = ECLASS_MISC as usize + 1;

/// Marker left in a class array when its member is deleted.
pub(crate) const ECLASS_TOMBSTONE: u16 = 0xFFFE;

/// Class of the guest range `[start, start + len)`.
///
/// Empty ranges and ranges that cross a window boundary map to
/// [`ECLASS_MISC`].
#[inline]
pub fn range_to_class(start: GuestAddr, len: u64) -> u16 {
    if len == 0 {
        return ECLASS_MISC;
    }
    let last = start.saturating_add(len - 1);
    let lo = start >> ECLASS_SHIFT;
    let hi = last >> ECLASS_SHIFT;
    if lo != hi || start.checked_add(len - 1).is_none() {
        return ECLASS_MISC;
    }
    (lo & ((1 << ECLASS_WIDTH) - 1)) as u16
}

/// Distinct classes of a translation's extents, sorted.
pub fn classes_of(extents: &[GuestExtent]) -> SmallVec<[u16; 3]> {
    let mut classes: SmallVec<[u16; 3]> = extents
        .iter()
        .map(|e| range_to_class(e.base, e.len as u64))
        .collect();
    classes.sort_unstable();
    classes.dedup();
    classes
}

/// Per-sector class arrays of slot numbers.
#[derive(Debug)]
pub struct EclassIndex {
    classes: Box<[Vec<u16>]>,
}

impl Default for EclassIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EclassIndex {
    /// Create an index with every class empty.
    pub fn new() -> Self {
        Self {
            classes: (0..ECLASS_COUNT).map(|_| Vec::new()).collect(),
        }
    }

    /// Append `slot` to `class`, returning its position in the array.
    pub fn register(&mut self, class: u16, slot: u16) -> u32 {
        let members = &mut self.classes[class as usize];
        let index = members.len() as u32;
        members.push(slot);
        index
    }

    /// Tombstone the entry at `index` in `class`.
    ///
    /// Returns the slot that was there.
    pub fn tombstone(&mut self, class: u16, index: u32) -> Option<u16> {
        let entry = self.classes[class as usize].get_mut(index as usize)?;
        let old = std::mem::replace(entry, ECLASS_TOMBSTONE);
        (old != ECLASS_TOMBSTONE).then_some(old)
    }

    /// Raw contents of `class`, tombstones included.
    #[inline]
    pub fn members(&self, class: u16) -> &[u16] {
        &self.classes[class as usize]
    }

    /// Live slots registered in `class`.
    pub fn live_members(&self, class: u16) -> impl Iterator<Item = u16> + '_ {
        self.members(class)
            .iter()
            .copied()
            .filter(|&s| s != ECLASS_TOMBSTONE)
    }

    /// Empty every class, keeping allocations.
    pub fn clear(&mut self) {
        for members in self.classes.iter_mut() {
            members.clear();
        }
    }

    /// Iterate `(class, index, slot)` over every non-tombstone entry.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (u16, u32, u16)> + '_ {
        self.classes.iter().enumerate().flat_map(|(class, members)| {
            members
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s != ECLASS_TOMBSTONE)
                .map(move |(i, &s)| (class as u16, i as u32, s))
        })
    }
}
