//! Host code ranges of a sector, sorted by arena offset.
//!
//! Code arenas are bump allocated, so ranges arrive in increasing order
//! and the list is append-only until the sector is reset. Deleted
//! translations keep their entry; the caller checks slot state.

use crate::types::SlotNo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HostExtent {
    /// Arena offset of the first byte.
    pub start: u32,
    pub len: u32,
    pub slot: SlotNo,
}

impl HostExtent {
    #[inline]
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset - self.start < self.len
    }
}

#[derive(Debug, Default)]
pub(crate) struct HostExtents {
    extents: Vec<HostExtent>,
}

impl HostExtents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, start: u32, len: u32, slot: SlotNo) {
        debug_assert!(
            self.extents.last().is_none_or(|e| e.start + e.len <= start),
            "host extents must be appended in arena order"
        );
        self.extents.push(HostExtent { start, len, slot });
    }

    /// The extent containing arena offset `offset`.
    pub fn find(&self, offset: u32) -> Option<HostExtent> {
        let idx = self.extents.partition_point(|e| e.start <= offset);
        let candidate = *self.extents.get(idx.checked_sub(1)?)?;
        candidate.contains(offset).then_some(candidate)
    }

    #[cfg(test)]
    pub fn as_slice(&self) -> &[HostExtent] {
        &self.extents
    }

    pub fn clear(&mut self) {
        self.extents.clear();
    }
}
