//! Translation records and chain edges.
//!
//! Records refer to each other only by `(SectorNo, SlotNo)`. An edge is
//! stored twice: as an [`OutEdge`] on the translation whose code holds the
//! patched jump, and as an [`InEdge`] on the translation it jumps to. The
//! pair is keyed by the source and the patch site offset, since one site
//! can only jump to one place.

use smallvec::SmallVec;

use crate::types::{GuestAddr, GuestExtent, SectorNo, SlotNo};

/// Inline capacity for inbound edges. Most translations are entered from
/// one or two places.
pub const INLINE_IN_EDGES: usize = 3;
/// Inline capacity for outbound edges. A block has at most two direct exits
/// in the common case (taken / fallthrough).
pub const INLINE_OUT_EDGES: usize = 2;

/// Inbound edge list.
pub type InEdges = SmallVec<[InEdge; INLINE_IN_EDGES]>;
/// Outbound edge list.
pub type OutEdges = SmallVec<[OutEdge; INLINE_OUT_EDGES]>;

// =============================================================================
// Slot Status
// =============================================================================

/// State of a slot in a sector's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Never used since the sector was last reset.
    Empty,
    /// Holds a live translation.
    InUse,
    /// Held a translation that has been deleted; sits on the free list.
    Deleted,
}

// =============================================================================
// Edges
// =============================================================================

/// A patched jump arriving at this translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InEdge {
    /// Sector of the translation containing the jump.
    pub from_sector: SectorNo,
    /// Slot of the translation containing the jump.
    pub from_slot: SlotNo,
    /// Offset of the jump site within the source's host code.
    pub from_offset: u32,
    /// Whether the jump enters past the event-check prologue.
    pub to_fast_entry: bool,
}

/// A patched jump leaving this translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutEdge {
    /// Sector of the target translation.
    pub to_sector: SectorNo,
    /// Slot of the target translation.
    pub to_slot: SlotNo,
    /// Offset of the jump site within this translation's host code.
    pub from_offset: u32,
    /// Whether the jump enters past the event-check prologue.
    pub to_fast_entry: bool,
}

/// Where a record is registered in its sector's equivalence-class index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EclassLink {
    /// Class number.
    pub class: u16,
    /// Position within the class array.
    pub index: u32,
}

// =============================================================================
// Translation Record
// =============================================================================

/// One cached translation.
#[derive(Debug, Clone)]
pub struct TransRecord {
    pub(crate) status: SlotStatus,
    pub(crate) entry: GuestAddr,
    pub(crate) extents: SmallVec<[GuestExtent; 3]>,
    /// Offset of the host code within the sector's arena.
    pub(crate) host_offset: u32,
    pub(crate) host_len: u32,
    pub(crate) weight: u32,
    pub(crate) eclasses: SmallVec<[EclassLink; 3]>,
    pub(crate) in_edges: InEdges,
    pub(crate) out_edges: OutEdges,
    /// Next slot on the sector free list, `u16::MAX` for none.
    pub(crate) next_free: u16,
    pub(crate) generation: u32,
}

impl TransRecord {
    /// An empty slot.
    pub(crate) fn empty(next_free: u16) -> Self {
        Self {
            status: SlotStatus::Empty,
            entry: 0,
            extents: SmallVec::new(),
            host_offset: 0,
            host_len: 0,
            weight: 0,
            eclasses: SmallVec::new(),
            in_edges: SmallVec::new(),
            out_edges: SmallVec::new(),
            next_free,
            generation: 0,
        }
    }

    /// Slot state.
    #[inline]
    pub fn status(&self) -> SlotStatus {
        self.status
    }

    /// Whether the slot holds a live translation.
    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.status == SlotStatus::InUse
    }

    /// Guest entry address.
    #[inline]
    pub fn entry(&self) -> GuestAddr {
        self.entry
    }

    /// Guest code covered.
    #[inline]
    pub fn extents(&self) -> &[GuestExtent] {
        &self.extents
    }

    /// Offset of the host code within the sector's arena.
    #[inline]
    pub fn host_offset(&self) -> u32 {
        self.host_offset
    }

    /// Length of the host code.
    #[inline]
    pub fn host_len(&self) -> u32 {
        self.host_len
    }

    /// Profile weight hint.
    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Patched jumps arriving here.
    #[inline]
    pub fn in_edges(&self) -> &[InEdge] {
        &self.in_edges
    }

    /// Patched jumps leaving here.
    #[inline]
    pub fn out_edges(&self) -> &[OutEdge] {
        &self.out_edges
    }

    /// Slot reuse counter.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether any extent overlaps `[start, start + len)`.
    pub fn overlaps(&self, start: GuestAddr, len: u64) -> bool {
        self.extents.iter().any(|e| e.overlaps(start, len))
    }

    /// The outbound edge patched at `offset`, if any.
    pub(crate) fn out_edge_at(&self, offset: u32) -> Option<OutEdge> {
        self.out_edges
            .iter()
            .copied()
            .find(|e| e.from_offset == offset)
    }

    /// Remove the outbound edge to `(sector, slot)` at `offset`.
    pub(crate) fn remove_out_edge(&mut self, sector: SectorNo, slot: SlotNo, offset: u32) -> bool {
        match self
            .out_edges
            .iter()
            .position(|e| e.to_sector == sector && e.to_slot == slot && e.from_offset == offset)
        {
            Some(pos) => {
                self.out_edges.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove the inbound edge from `(sector, slot)` at `offset`.
    pub(crate) fn remove_in_edge(&mut self, sector: SectorNo, slot: SlotNo, offset: u32) -> bool {
        match self.in_edges.iter().position(|e| {
            e.from_sector == sector && e.from_slot == slot && e.from_offset == offset
        }) {
            Some(pos) => {
                self.in_edges.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Clear everything but the free-list link and generation.
    pub(crate) fn clear(&mut self) {
        self.entry = 0;
        self.extents.clear();
        self.host_offset = 0;
        self.host_len = 0;
        self.weight = 0;
        self.eclasses.clear();
        self.in_edges.clear();
        self.out_edges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(sector: u16, slot: u16, offset: u32) -> OutEdge {
        OutEdge {
            to_sector: SectorNo(sector),
            to_slot: SlotNo(slot),
            from_offset: offset,
            to_fast_entry: false,
        }
    }

    fn inbound(sector: u16, slot: u16, offset: u32) -> InEdge {
        InEdge {
            from_sector: SectorNo(sector),
            from_slot: SlotNo(slot),
            from_offset: offset,
            to_fast_entry: true,
        }
    }

    #[test]
    fn test_empty_record() {
        let rec = TransRecord::empty(7);
        assert_eq!(rec.status(), SlotStatus::Empty);
        assert!(!rec.is_in_use());
        assert_eq!(rec.next_free, 7);
        assert!(rec.in_edges().is_empty());
    }

    #[test]
    fn test_edges_spill_past_inline_capacity() {
        let mut rec = TransRecord::empty(0);
        for i in 0..8 {
            rec.in_edges.push(inbound(0, i, 0));
        }
        assert!(rec.in_edges.spilled());
        assert!(rec.remove_in_edge(SectorNo(0), SlotNo(3), 0));
        assert!(!rec.remove_in_edge(SectorNo(0), SlotNo(3), 0));
        assert_eq!(rec.in_edges().len(), 7);
    }

    #[test]
    fn test_remove_out_edge_matches_offset() {
        let mut rec = TransRecord::empty(0);
        rec.out_edges.push(out(1, 2, 16));
        rec.out_edges.push(out(1, 2, 32));

        assert!(!rec.remove_out_edge(SectorNo(1), SlotNo(2), 48));
        assert!(rec.remove_out_edge(SectorNo(1), SlotNo(2), 16));
        assert_eq!(rec.out_edges(), &[out(1, 2, 32)]);
        assert_eq!(rec.out_edge_at(32), Some(out(1, 2, 32)));
        assert_eq!(rec.out_edge_at(16), None);
    }

    #[test]
    fn test_overlaps_any_extent() {
        let mut rec = TransRecord::empty(0);
        rec.extents.push(GuestExtent::new(0x1000, 0x10));
        rec.extents.push(GuestExtent::new(0x3000, 0x10));
        assert!(rec.overlaps(0x3008, 1));
        assert!(!rec.overlaps(0x2000, 0x1000));
    }

    #[test]
    fn test_clear_keeps_generation() {
        let mut rec = TransRecord::empty(0);
        rec.generation = 5;
        rec.entry = 0x1000;
        rec.out_edges.push(out(0, 0, 0));
        rec.clear();
        assert_eq!(rec.generation(), 5);
        assert_eq!(rec.entry(), 0);
        assert!(rec.out_edges().is_empty());
    }
}
