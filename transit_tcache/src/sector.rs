//! A sector: one code arena plus the records and indexes describing it.
//!
//! Code is bump allocated from the front of the arena and never freed
//! individually. Slots are handed out from an intrusive free list that
//! threads through `Empty` and `Deleted` records, so a deleted slot is
//! reused before the sector is considered full. Everything is reset at
//! once when the sector is recycled.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::eclass::EclassIndex;
use crate::hash_index::LookupTable;
use crate::host::CodeRegion;
use crate::host_extents::HostExtents;
use crate::record::{SlotStatus, TransRecord};
use crate::types::{HostAddr, SectorNo, SlotNo};

/// Alignment of each translation's host code.
pub(crate) const CODE_ALIGN: usize = 16;

/// End of the free list.
const NO_SLOT: u16 = u16::MAX;

#[inline]
const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[derive(Debug)]
pub(crate) struct Sector<R> {
    pub no: SectorNo,
    pub region: R,
    /// Bump pointer into `region`.
    pub code_used: usize,
    pub slots: Box<[TransRecord]>,
    free_head: u16,
    pub in_use: usize,
    pub table: LookupTable,
    pub eclasses: EclassIndex,
    pub host_extents: HostExtents,
    /// One execution counter per slot when profiling.
    pub counters: Option<Box<[AtomicU64]>>,
    /// Times this sector has been recycled.
    pub recycles: u64,
}

impl<R: CodeRegion> Sector<R> {
    pub fn new(no: SectorNo, region: R, slot_count: usize, profiling: bool) -> Self {
        debug_assert!(slot_count <= SlotNo::MAX_SLOTS);
        let slots = (0..slot_count)
            .map(|i| TransRecord::empty(next_link(i, slot_count)))
            .collect();
        let counters = profiling.then(|| (0..slot_count).map(|_| AtomicU64::new(0)).collect());
        Self {
            no,
            region,
            code_used: 0,
            slots,
            free_head: if slot_count == 0 { NO_SLOT } else { 0 },
            in_use: 0,
            table: LookupTable::new(slot_count),
            eclasses: EclassIndex::new(),
            host_extents: HostExtents::new(),
            counters,
            recycles: 0,
        }
    }

    /// Whether a translation of `len` bytes no longer fits.
    pub fn is_full_for(&self, len: usize, usable_slots: usize) -> bool {
        self.in_use >= usable_slots
            || self.free_head == NO_SLOT
            || align_up(self.code_used, CODE_ALIGN) + len > self.region.capacity()
    }

    /// Take a slot off the free list and mark it in use.
    pub fn alloc_slot(&mut self) -> Option<SlotNo> {
        if self.free_head == NO_SLOT {
            return None;
        }
        let slot = self.free_head;
        let rec = &mut self.slots[slot as usize];
        debug_assert_ne!(rec.status, SlotStatus::InUse);
        self.free_head = rec.next_free;
        rec.next_free = NO_SLOT;
        rec.status = SlotStatus::InUse;
        self.in_use += 1;
        Some(SlotNo(slot))
    }

    /// Reserve `len` bytes of code space, returning the arena offset.
    ///
    /// The caller has checked `is_full_for`.
    pub fn alloc_code(&mut self, len: usize) -> usize {
        let offset = align_up(self.code_used, CODE_ALIGN);
        debug_assert!(offset + len <= self.region.capacity());
        self.code_used = offset + len;
        offset
    }

    /// Return a slot to the free list. The record must already be unlinked
    /// from every index and edge list.
    pub fn release_slot(&mut self, slot: SlotNo) {
        let rec = &mut self.slots[slot.index()];
        debug_assert_eq!(rec.status, SlotStatus::InUse);
        rec.clear();
        rec.status = SlotStatus::Deleted;
        rec.generation = rec.generation.wrapping_add(1);
        rec.next_free = self.free_head;
        self.free_head = slot.0;
        self.in_use -= 1;
    }

    /// Erase every translation and rewind the arena.
    ///
    /// Edges must already have been unchained.
    pub fn reset(&mut self) {
        let count = self.slots.len();
        for (i, rec) in self.slots.iter_mut().enumerate() {
            if rec.status == SlotStatus::InUse {
                rec.generation = rec.generation.wrapping_add(1);
            }
            rec.clear();
            rec.status = SlotStatus::Empty;
            rec.next_free = next_link(i, count);
        }
        self.free_head = if count == 0 { NO_SLOT } else { 0 };
        self.in_use = 0;
        self.table.clear();
        self.eclasses.clear();
        self.host_extents.clear();
        self.code_used = 0;
        if let Some(counters) = &self.counters {
            for c in counters.iter() {
                c.store(0, Ordering::Relaxed);
            }
        }
        self.recycles += 1;
    }

    #[inline]
    pub fn host_addr(&self, offset: u32) -> HostAddr {
        self.region.base() + offset as usize
    }

    /// Whether `addr` lies in this sector's used code.
    #[inline]
    pub fn contains_used(&self, addr: HostAddr) -> bool {
        let base = self.region.base();
        addr >= base && addr - base < self.code_used
    }

    /// Address of the profile counter for `slot`.
    pub fn counter_addr(&self, slot: SlotNo) -> Option<HostAddr> {
        let counters = self.counters.as_ref()?;
        Some(&counters[slot.index()] as *const AtomicU64 as HostAddr)
    }

    /// Number of slots reachable from the free list.
    pub fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut cur = self.free_head;
        while cur != NO_SLOT && len <= self.slots.len() {
            len += 1;
            cur = self.slots[cur as usize].next_free;
        }
        len
    }
}

#[inline]
fn next_link(i: usize, count: usize) -> u16 {
    if i + 1 < count { (i + 1) as u16 } else { NO_SLOT }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::heap::HeapRegion;

    fn sector(slots: usize) -> Sector<HeapRegion> {
        Sector::new(SectorNo(0), HeapRegion::new(256), slots, true)
    }

    #[test]
    fn test_slot_allocation_order() {
        let mut s = sector(4);
        assert_eq!(s.free_list_len(), 4);
        assert_eq!(s.alloc_slot(), Some(SlotNo(0)));
        assert_eq!(s.alloc_slot(), Some(SlotNo(1)));
        assert_eq!(s.in_use, 2);
        assert_eq!(s.free_list_len(), 2);
    }

    #[test]
    fn test_released_slot_is_reused_first() {
        let mut s = sector(4);
        let a = s.alloc_slot().expect("slot");
        let _b = s.alloc_slot().expect("slot");
        s.release_slot(a);
        assert_eq!(s.slots[a.index()].status(), SlotStatus::Deleted);
        assert_eq!(s.slots[a.index()].generation(), 1);
        assert_eq!(s.alloc_slot(), Some(a));
    }

    #[test]
    fn test_exhaustion() {
        let mut s = sector(2);
        s.alloc_slot();
        s.alloc_slot();
        assert_eq!(s.alloc_slot(), None);
        assert!(s.is_full_for(1, 100));
    }

    #[test]
    fn test_code_is_aligned() {
        let mut s = sector(4);
        assert_eq!(s.alloc_code(5), 0);
        assert_eq!(s.alloc_code(5), 16);
        assert_eq!(s.code_used, 21);
        assert!(!s.is_full_for(200, 4));
        assert!(s.is_full_for(225, 4));
        assert!(s.contains_used(s.region.base() + 20));
        assert!(!s.contains_used(s.region.base() + 21));
    }

    #[test]
    fn test_fill_limit() {
        let mut s = sector(4);
        s.alloc_slot();
        s.alloc_slot();
        assert!(!s.is_full_for(1, 3));
        s.alloc_slot();
        assert!(s.is_full_for(1, 3));
    }

    #[test]
    fn test_reset() {
        let mut s = sector(3);
        let a = s.alloc_slot().expect("slot");
        let b = s.alloc_slot().expect("slot");
        s.release_slot(b);
        s.alloc_code(64);
        s.eclasses.register(1, a.0);
        s.host_extents.push(0, 64, a);
        if let Some(c) = &s.counters {
            c[0].store(9, Ordering::Relaxed);
        }

        s.reset();

        assert_eq!(s.recycles, 1);
        assert_eq!(s.in_use, 0);
        assert_eq!(s.code_used, 0);
        assert_eq!(s.free_list_len(), 3);
        assert!(s.eclasses.members(1).is_empty());
        assert!(s.host_extents.as_slice().is_empty());
        assert!(s.slots.iter().all(|r| r.status() == SlotStatus::Empty));
        // In-use slot bumped by reset, deleted one only by its release.
        assert_eq!(s.slots[a.index()].generation(), 1);
        assert_eq!(s.slots[b.index()].generation(), 1);
        let counters = s.counters.as_ref().expect("profiling on");
        assert_eq!(counters[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_counter_addresses_are_stable() {
        let s = sector(2);
        let a = s.counter_addr(SlotNo(0)).expect("counter");
        let b = s.counter_addr(SlotNo(1)).expect("counter");
        assert_eq!(b - a, std::mem::size_of::<AtomicU64>());
        let plain = Sector::new(SectorNo(1), HeapRegion::new(16), 2, false);
        assert_eq!(plain.counter_addr(SlotNo(0)), None);
    }
}
