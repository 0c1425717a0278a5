//! Per-sector open-addressed lookup table.
//!
//! Buckets hold slot numbers. Probing is linear from the guest address's
//! home bucket and stops at the first `EMPTY`; deleted entries leave a
//! `TOMBSTONE` so later probes keep walking past them. The table is at
//! least twice the slot count and is rebuilt once live entries plus
//! tombstones pass three quarters of it, so every probe terminates.

use crate::record::TransRecord;
use crate::types::{GuestAddr, SlotNo};

/// Bucket never used since the last reset.
pub(crate) const EMPTY: u16 = 0xFFFF;
/// Bucket whose entry was deleted.
pub(crate) const TOMBSTONE: u16 = 0xFFFE;

/// Fibonacci hash of a guest address into `bits` bits.
#[inline]
pub(crate) fn hash_addr(addr: GuestAddr, bits: u32) -> usize {
    debug_assert!((1..64).contains(&bits));
    let mixed = addr ^ (addr >> 32);
    (mixed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - bits)) as usize
}

#[derive(Debug)]
pub(crate) struct LookupTable {
    buckets: Box<[u16]>,
    bits: u32,
    live: usize,
    tombstones: usize,
}

impl LookupTable {
    /// Create a table for a sector with `slots` slots.
    pub fn new(slots: usize) -> Self {
        let len = (slots * 2).next_power_of_two().max(4);
        Self {
            buckets: vec![EMPTY; len].into_boxed_slice(),
            bits: len.trailing_zeros(),
            live: 0,
            tombstones: 0,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    /// Find the in-use slot whose entry address is `guest`.
    pub fn find(&self, guest: GuestAddr, slots: &[TransRecord]) -> Option<SlotNo> {
        let mut idx = hash_addr(guest, self.bits);
        for _ in 0..self.buckets.len() {
            match self.buckets[idx] {
                EMPTY => return None,
                TOMBSTONE => {}
                slot => {
                    let rec = &slots[slot as usize];
                    if rec.is_in_use() && rec.entry == guest {
                        return Some(SlotNo(slot));
                    }
                }
            }
            idx = (idx + 1) & self.mask();
        }
        None
    }

    /// Whether one more insert would push the table past its load limit.
    #[inline]
    pub fn needs_rehash(&self) -> bool {
        (self.live + self.tombstones + 1) * 4 > self.buckets.len() * 3
    }

    /// Insert `guest -> slot` into the first free or tombstoned bucket.
    ///
    /// The caller rebuilds the table first whenever `needs_rehash` says so.
    pub fn insert(&mut self, guest: GuestAddr, slot: SlotNo) {
        debug_assert!(slot.index() < SlotNo::MAX_SLOTS);
        let mut idx = hash_addr(guest, self.bits);
        for _ in 0..self.buckets.len() {
            match self.buckets[idx] {
                EMPTY => {
                    self.buckets[idx] = slot.0;
                    self.live += 1;
                    return;
                }
                TOMBSTONE => {
                    self.buckets[idx] = slot.0;
                    self.tombstones -= 1;
                    self.live += 1;
                    return;
                }
                _ => idx = (idx + 1) & self.mask(),
            }
        }
        unreachable!("lookup table full: {} live, {} tombstones", self.live, self.tombstones);
    }

    /// Tombstone the bucket holding `slot` on `guest`'s probe chain.
    pub fn remove(&mut self, guest: GuestAddr, slot: SlotNo) -> bool {
        let mut idx = hash_addr(guest, self.bits);
        for _ in 0..self.buckets.len() {
            match self.buckets[idx] {
                EMPTY => return false,
                b if b == slot.0 => {
                    self.buckets[idx] = TOMBSTONE;
                    self.live -= 1;
                    self.tombstones += 1;
                    return true;
                }
                _ => idx = (idx + 1) & self.mask(),
            }
        }
        false
    }

    /// Rebuild from the in-use records, dropping every tombstone.
    pub fn rebuild(&mut self, slots: &[TransRecord]) {
        self.clear();
        for (i, rec) in slots.iter().enumerate() {
            if rec.is_in_use() {
                self.insert(rec.entry, SlotNo(i as u16));
            }
        }
    }

    pub fn clear(&mut self) {
        self.buckets.fill(EMPTY);
        self.live = 0;
        self.tombstones = 0;
    }

    /// Slot numbers currently stored.
    pub fn occupied(&self) -> impl Iterator<Item = SlotNo> + '_ {
        self.buckets
            .iter()
            .filter(|&&b| b != EMPTY && b != TOMBSTONE)
            .map(|&b| SlotNo(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SlotStatus;

    fn records(entries: &[GuestAddr]) -> Vec<TransRecord> {
        entries
            .iter()
            .map(|&entry| {
                let mut rec = TransRecord::empty(u16::MAX);
                rec.status = SlotStatus::InUse;
                rec.entry = entry;
                rec
            })
            .collect()
    }

    #[test]
    fn test_sizing() {
        assert_eq!(LookupTable::new(1).len(), 4);
        assert_eq!(LookupTable::new(64).len(), 128);
        assert_eq!(LookupTable::new(100).len(), 256);
    }

    #[test]
    fn test_hash_in_range() {
        for addr in [0u64, 1, 0x1000, u64::MAX, 0xdead_beef_0000_1234] {
            assert!(hash_addr(addr, 7) < 128);
        }
    }

    #[test]
    fn test_insert_find_remove() {
        let recs = records(&[0x1000, 0x2000, 0x3000]);
        let mut table = LookupTable::new(recs.len());
        for (i, rec) in recs.iter().enumerate() {
            table.insert(rec.entry, SlotNo(i as u16));
        }

        assert_eq!(table.find(0x2000, &recs), Some(SlotNo(1)));
        assert_eq!(table.find(0x4000, &recs), None);

        assert!(table.remove(0x2000, SlotNo(1)));
        assert!(!table.remove(0x2000, SlotNo(1)));
        assert_eq!(table.find(0x2000, &recs), None);
        assert_eq!(table.live(), 2);
        assert_eq!(table.tombstones(), 1);
    }

    #[test]
    fn test_probe_walks_past_tombstones() {
        // Every entry collides, so they form one probe chain.
        let mut recs = Vec::new();
        let home = hash_addr(0x1000, 3);
        let mut addr = 0x1000u64;
        while recs.len() < 3 {
            if hash_addr(addr, 3) == home {
                recs.extend(records(&[addr]));
            }
            addr += 1;
        }
        let mut table = LookupTable::new(4);
        assert_eq!(table.len(), 8);
        for (i, rec) in recs.iter().enumerate() {
            table.insert(rec.entry, SlotNo(i as u16));
        }

        assert!(table.remove(recs[0].entry, SlotNo(0)));
        assert_eq!(table.find(recs[2].entry, &recs), Some(SlotNo(2)));

        // A new insert reuses the tombstone at the head of the chain.
        table.insert(recs[0].entry, SlotNo(0));
        assert_eq!(table.tombstones(), 0);
        assert_eq!(table.find(recs[0].entry, &recs), Some(SlotNo(0)));
    }

    #[test]
    fn test_find_ignores_dead_records() {
        let mut recs = records(&[0x1000]);
        let mut table = LookupTable::new(1);
        table.insert(0x1000, SlotNo(0));
        recs[0].status = SlotStatus::Deleted;
        assert_eq!(table.find(0x1000, &recs), None);
    }

    #[test]
    fn test_rebuild_drops_tombstones() {
        let recs = records(&[0x10, 0x20, 0x30]);
        let mut table = LookupTable::new(3);
        for (i, rec) in recs.iter().enumerate() {
            table.insert(rec.entry, SlotNo(i as u16));
        }
        table.remove(0x10, SlotNo(0));
        table.remove(0x20, SlotNo(1));
        table.insert(0x20, SlotNo(1));

        table.rebuild(&recs);
        assert_eq!(table.tombstones(), 0);
        assert_eq!(table.live(), 3);
        assert_eq!(table.occupied().count(), 3);
        for (i, rec) in recs.iter().enumerate() {
            assert_eq!(table.find(rec.entry, &recs), Some(SlotNo(i as u16)));
        }
    }

    #[test]
    fn test_needs_rehash_threshold() {
        let mut table = LookupTable::new(2);
        assert_eq!(table.len(), 4);
        table.insert(1, SlotNo(0));
        table.insert(2, SlotNo(1));
        // Two live; a third would make 3 of 4 buckets used.
        assert!(!table.needs_rehash());
        table.insert(3, SlotNo(2));
        assert!(table.needs_rehash());
    }
}
