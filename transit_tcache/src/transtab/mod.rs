//! The translation table.
//!
//! `TransTab` owns every sector, the search order and the fast cache. It
//! is the single entry point for adding, finding, chaining and discarding
//! translations.
//!
//! # Sector rotation
//!
//! Translations go into the youngest sector. When it lacks code space or
//! slots, the next sector in round-robin order becomes youngest: mapped
//! on first use, recycled wholesale on every later turn. A translation
//! that passed validation therefore always fits after at most one
//! rotation.
//!
//! # Deletion
//!
//! Every path that removes a translation (range invalidation, duplicate
//! replacement, sector recycle) unchains it first, so no live code is
//! ever left jumping into a freed slot.

mod chain;
mod discard;
mod profile;

pub use chain::{ChainOutcome, DropReason};
pub use profile::ProfileEntry;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, error, info, trace};

use crate::config::{SanityLevel, TcacheConfig};
use crate::eclass::classes_of;
use crate::error::{TcacheError, TcacheResult};
use crate::fast_cache::FastCache;
use crate::host::{CodeRegion, HostBackend};
use crate::record::{EclassLink, TransRecord};
use crate::search_order::SearchOrder;
use crate::sector::Sector;
use crate::stats::TcacheStats;
use crate::types::{
    FoundTranslation, GuestAddr, HostAddr, NewTranslation, SectorNo, SlotNo, TransRef,
};

/// Bytes of the profile counter immediate patched into host code.
const PROF_IMM_LEN: usize = 8;

// =============================================================================
// TransTab
// =============================================================================

/// Cache of translated code, indexed by guest entry address.
pub struct TransTab<B: HostBackend> {
    pub(crate) backend: B,
    pub(crate) config: TcacheConfig,
    /// Allocated sectors. Sectors are mapped in round-robin order, so the
    /// sector numbered `i` is always at index `i`.
    pub(crate) sectors: Vec<Sector<B::Region>>,
    pub(crate) youngest: Option<usize>,
    pub(crate) order: SearchOrder,
    pub(crate) fast: Arc<FastCache>,
    pub(crate) stats: TcacheStats,
}

impl<B: HostBackend> TransTab<B> {
    /// Create an empty table. No code arena is mapped until the first
    /// translation arrives.
    pub fn new(config: TcacheConfig, backend: B) -> TcacheResult<Self> {
        config.validate()?;
        debug!(
            sectors = config.sectors,
            slots = config.slots_per_sector,
            arena_bytes = config.arena_bytes(),
            "translation table created"
        );
        Ok(Self {
            fast: Arc::new(FastCache::new(config.fast_cache_bits)),
            sectors: Vec::with_capacity(config.sectors),
            youngest: None,
            order: SearchOrder::new(),
            stats: TcacheStats::default(),
            backend,
            config,
        })
    }

    /// Configuration the table was built with.
    #[inline]
    pub fn config(&self) -> &TcacheConfig {
        &self.config
    }

    /// Host services in use.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Shared handle to the fast cache, for lock-free probing.
    #[inline]
    pub fn fast_cache(&self) -> &Arc<FastCache> {
        &self.fast
    }

    // =========================================================================
    // Adding
    // =========================================================================

    /// Copy a translation into the table.
    ///
    /// Replaces any existing translation with the same entry address.
    /// Only fails on malformed input or when a code arena cannot be
    /// mapped; a full table makes room by recycling a sector.
    pub fn add_translation(&mut self, t: &NewTranslation<'_>) -> TcacheResult<TransRef> {
        self.validate(t)?;

        let replaced = self.locate(t.entry);
        if let Some((_, s, slot)) = replaced {
            trace!(entry = format_args!("{:#x}", t.entry), "replacing translation");
            self.delete_translation(s, slot);
        }

        let len = t.code.len();
        let s = match self.ensure_room(len) {
            Ok(s) => s,
            Err(err) => {
                // The replaced translation may still be in the fast cache.
                if replaced.is_some() {
                    self.fast.invalidate_all();
                }
                return Err(err);
            }
        };
        let sector = &mut self.sectors[s];

        if sector.table.needs_rehash() {
            sector.table.rebuild(&sector.slots);
            self.stats.table_rehashes += 1;
        }

        let Some(slot) = sector.alloc_slot() else {
            unreachable!("sector {s} reported room but has no free slot");
        };
        let offset = sector.alloc_code(len);
        sector.region.write(offset, t.code);
        let host = sector.host_addr(offset as u32);
        self.backend.flush_icache(host, len);

        let rec = &mut sector.slots[slot.index()];
        rec.entry = t.entry;
        rec.extents = t.extents.iter().copied().collect();
        rec.host_offset = offset as u32;
        rec.host_len = len as u32;
        rec.weight = t.weight;
        let generation = rec.generation;

        for class in classes_of(t.extents) {
            let index = sector.eclasses.register(class, slot.0);
            sector.slots[slot.index()]
                .eclasses
                .push(EclassLink { class, index });
        }
        sector.table.insert(t.entry, slot);
        sector.host_extents.push(offset as u32, len as u32, slot);

        if let (Some(prof), Some(counter)) = (t.prof_inc_offset, sector.counter_addr(slot)) {
            self.backend
                .patch_profile_counter(&mut sector.region, offset + prof as usize, counter);
        }

        self.fast.insert(t.entry, host);
        self.stats.translations_added += 1;
        self.stats.code_bytes += len as u64;

        trace!(
            entry = format_args!("{:#x}", t.entry),
            sector = s,
            slot = slot.0,
            len,
            "added translation"
        );

        if self.config.sanity_level >= SanityLevel::Always {
            self.assert_sane();
        }

        Ok(TransRef {
            sector: SectorNo(s as u16),
            slot,
            generation,
        })
    }

    fn validate(&self, t: &NewTranslation<'_>) -> TcacheResult<()> {
        if !(1..=3).contains(&t.extents.len()) {
            return Err(TcacheError::InvalidExtentCount(t.extents.len()));
        }
        if let Some(e) = t.extents.iter().find(|e| e.len == 0) {
            return Err(TcacheError::EmptyExtent { base: e.base });
        }
        if t.code.is_empty() {
            return Err(TcacheError::EmptyCode);
        }
        let max = self.config.max_code_len();
        if t.code.len() > max {
            return Err(TcacheError::CodeTooLarge {
                len: t.code.len(),
                max,
            });
        }
        if let Some(offset) = t.prof_inc_offset {
            if offset as usize + PROF_IMM_LEN > t.code.len() {
                return Err(TcacheError::BadProfileOffset {
                    offset,
                    len: t.code.len(),
                });
            }
        }
        Ok(())
    }

    /// Index of a sector with room for `len` bytes, rotating if needed.
    fn ensure_room(&mut self, len: usize) -> TcacheResult<usize> {
        let usable = self.config.usable_slots();
        if let Some(y) = self.youngest {
            if !self.sectors[y].is_full_for(len, usable) {
                return Ok(y);
            }
        }

        let next = match self.youngest {
            None => 0,
            Some(y) => (y + 1) % self.config.sectors,
        };
        if next == self.sectors.len() {
            self.init_sector(next)?;
        } else {
            self.recycle_sector(next);
        }
        self.youngest = Some(next);
        Ok(next)
    }

    fn init_sector(&mut self, s: usize) -> TcacheResult<()> {
        let bytes = self.config.arena_bytes();
        let region = self.backend.map_region(bytes).map_err(|source| {
            error!(sector = s, bytes, error = %source, "cannot map code arena");
            TcacheError::ArenaMap { bytes, source }
        })?;
        debug!(
            sector = s,
            base = format_args!("{:#x}", region.base()),
            bytes = region.capacity(),
            "initialised sector"
        );
        let no = SectorNo(s as u16);
        self.sectors.push(Sector::new(
            no,
            region,
            self.config.slots_per_sector,
            self.config.profiling,
        ));
        self.order.push(no);
        Ok(())
    }

    /// Unchain and erase every translation in sector `s`.
    pub(crate) fn recycle_sector(&mut self, s: usize) {
        let live: Vec<SlotNo> = self.sectors[s]
            .slots
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.is_in_use())
            .map(|(i, _)| SlotNo(i as u16))
            .collect();
        for &slot in &live {
            self.unchain_for_deletion(s, slot);
        }

        let sector = &mut self.sectors[s];
        sector.reset();
        let recycles = sector.recycles;
        self.order.demote_to_back(SectorNo(s as u16));
        self.fast.invalidate_all();
        self.stats.sectors_recycled += 1;

        debug!(sector = s, dropped = live.len(), recycles, "recycled sector");

        if self.config.sanity_level >= SanityLevel::OnRecycle {
            self.assert_sane();
        }
    }

    /// Unlink and free one translation. The fast cache may still name it;
    /// the caller invalidates or overwrites that entry.
    pub(crate) fn delete_translation(&mut self, s: usize, slot: SlotNo) {
        self.unchain_for_deletion(s, slot);

        let sector = &mut self.sectors[s];
        let rec = &mut sector.slots[slot.index()];
        let entry = rec.entry;
        let links = std::mem::take(&mut rec.eclasses);
        for link in links {
            sector.eclasses.tombstone(link.class, link.index);
        }
        sector.table.remove(entry, slot);
        if let Some(counters) = &sector.counters {
            counters[slot.index()].store(0, Ordering::Relaxed);
        }
        sector.release_slot(slot);
        self.stats.translations_deleted += 1;
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Probe the fast cache only.
    #[inline]
    pub fn lookup_fast(&self, guest: GuestAddr) -> Option<HostAddr> {
        self.fast.lookup(guest)
    }

    /// Search every sector for a translation entered at `guest`.
    ///
    /// On a hit the winning sector moves one place up the search order
    /// and, if `update_fast` is set, the fast cache is refreshed.
    pub fn lookup_full(&mut self, guest: GuestAddr, update_fast: bool) -> Option<FoundTranslation> {
        self.stats.full_lookups += 1;
        let (pos, s, slot) = self.locate(guest)?;
        self.order.promote(pos);

        let sector = &self.sectors[s];
        let rec = &sector.slots[slot.index()];
        let host = sector.host_addr(rec.host_offset);
        if update_fast {
            self.fast.insert(guest, host);
        }
        self.stats.full_hits += 1;

        Some(FoundTranslation {
            host,
            trans: TransRef {
                sector: SectorNo(s as u16),
                slot,
                generation: rec.generation,
            },
        })
    }

    /// Find `guest` without side effects: `(search position, sector, slot)`.
    pub(crate) fn locate(&self, guest: GuestAddr) -> Option<(usize, usize, SlotNo)> {
        self.order
            .as_slice()
            .iter()
            .enumerate()
            .find_map(|(pos, &no)| {
                let sector = &self.sectors[no.index()];
                sector
                    .table
                    .find(guest, &sector.slots)
                    .map(|slot| (pos, no.index(), slot))
            })
    }

    // =========================================================================
    // Host address queries
    // =========================================================================

    /// Find the live translation whose host code contains `addr`.
    ///
    /// Sectors are tried in search order. A hit on a deleted slot, or on
    /// a slot that has since been reused for newer code, counts as a miss.
    pub fn find_by_host_addr(&self, addr: HostAddr) -> Option<(SectorNo, SlotNo)> {
        self.order.as_slice().iter().find_map(|&no| {
            let sector = &self.sectors[no.index()];
            if !sector.contains_used(addr) {
                return None;
            }
            let offset = (addr - sector.region.base()) as u32;
            let ext = sector.host_extents.find(offset)?;
            let rec = &sector.slots[ext.slot.index()];
            (rec.is_in_use() && rec.host_offset == ext.start).then_some((no, ext.slot))
        })
    }

    /// Whether `addr` lies in the used part of any code arena.
    pub fn contains_host_addr(&self, addr: HostAddr) -> bool {
        self.sectors.iter().any(|s| s.contains_used(addr))
    }

    /// Decode the jump site at host address `site`.
    pub fn decode_patch_site(&self, site: HostAddr) -> Option<HostAddr> {
        let sector = self.sectors.iter().find(|s| s.region.contains(site))?;
        self.backend
            .decode_jump(&sector.region, site - sector.region.base())
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// The record `trans` refers to, if it is still live.
    pub fn record(&self, trans: TransRef) -> Option<&TransRecord> {
        let rec = self
            .sectors
            .get(trans.sector.index())?
            .slots
            .get(trans.slot.index())?;
        (rec.is_in_use() && rec.generation == trans.generation).then_some(rec)
    }

    /// Start of the host code of `trans`.
    pub fn host_addr(&self, trans: TransRef) -> Option<HostAddr> {
        let rec = self.record(trans)?;
        Some(self.sectors[trans.sector.index()].host_addr(rec.host_offset))
    }

    /// Host code bytes of `trans`.
    pub fn host_code(&self, trans: TransRef) -> Option<&[u8]> {
        let rec = self.record(trans)?;
        let region = &self.sectors[trans.sector.index()].region;
        Some(region.read(rec.host_offset as usize, rec.host_len as usize))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Live translations across all sectors.
    pub fn resident_count(&self) -> usize {
        self.sectors.iter().map(|s| s.in_use).sum()
    }

    /// Sectors mapped so far.
    pub fn allocated_sectors(&self) -> usize {
        self.sectors.len()
    }

    /// Sector currently receiving translations.
    pub fn youngest_sector(&self) -> Option<SectorNo> {
        self.youngest.map(|y| SectorNo(y as u16))
    }

    /// Current sector search order.
    pub fn search_order(&self) -> &[SectorNo] {
        self.order.as_slice()
    }

    /// Activity counters.
    pub fn stats(&self) -> TcacheStats {
        let mut stats = self.stats.clone();
        stats.fast_hits = self.fast.hits();
        stats.fast_misses = self.fast.misses();
        stats.fast_invalidations = self.fast.invalidations();
        stats
    }

    /// Log a summary of the counters at `info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            added = stats.translations_added,
            deleted = stats.translations_deleted,
            resident = self.resident_count(),
            code_bytes = stats.code_bytes,
            full_lookups = stats.full_lookups,
            full_hit_rate = stats.full_hit_rate(),
            fast_hit_rate = stats.fast_hit_rate(),
            chains = stats.chains,
            chains_dropped = stats.chains_dropped,
            unchains = stats.unchains,
            recycled = stats.sectors_recycled,
            "translation table statistics"
        );
        for (reason, count) in &stats.discards {
            info!(reason = %reason, count, "discarded translations");
        }
    }
}

impl<B: HostBackend> std::fmt::Debug for TransTab<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransTab")
            .field("sectors", &self.sectors.len())
            .field("youngest", &self.youngest)
            .field("order", &self.order.as_slice())
            .field("resident", &self.resident_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::heap::HeapBackend;
    use crate::types::GuestExtent;

    pub(crate) fn small_table() -> TransTab<HeapBackend> {
        let config = TcacheConfig {
            sanity_level: SanityLevel::Always,
            ..TcacheConfig::small()
        };
        TransTab::new(config, HeapBackend::default()).expect("valid config")
    }

    pub(crate) fn add(tab: &mut TransTab<HeapBackend>, entry: GuestAddr, len: usize) -> TransRef {
        let extents = [GuestExtent::new(entry, 16)];
        let code = vec![0x90u8; len];
        tab.add_translation(&NewTranslation::new(entry, &extents, &code))
            .expect("add translation")
    }

    #[test]
    fn test_sectors_are_mapped_lazily() {
        let mut tab = small_table();
        assert_eq!(tab.allocated_sectors(), 0);
        add(&mut tab, 0x1000, 32);
        assert_eq!(tab.allocated_sectors(), 1);
        assert_eq!(tab.youngest_sector(), Some(SectorNo(0)));
    }

    #[test]
    fn test_add_then_lookup() {
        let mut tab = small_table();
        let t = add(&mut tab, 0x1000, 32);
        let host = tab.host_addr(t).expect("live");

        assert_eq!(tab.lookup_fast(0x1000), Some(host));
        let found = tab.lookup_full(0x1000, false).expect("hit");
        assert_eq!(found.host, host);
        assert_eq!(found.trans, t);
        assert_eq!(tab.host_code(t), Some(&[0x90u8; 32][..]));
        assert!(tab.lookup_full(0x2000, false).is_none());
    }

    #[test]
    fn test_add_flushes_icache() {
        let mut tab = small_table();
        add(&mut tab, 0x1000, 40);
        assert_eq!(tab.backend().flush_count(), 1);
        assert_eq!(tab.backend().flushed_bytes(), 40);
    }

    #[test]
    fn test_duplicate_entry_replaces() {
        let mut tab = small_table();
        let old = add(&mut tab, 0x1000, 16);
        let new = add(&mut tab, 0x1000, 24);

        assert!(tab.record(old).is_none());
        assert_eq!(tab.resident_count(), 1);
        let found = tab.lookup_full(0x1000, false).expect("hit");
        assert_eq!(found.trans, new);
        assert_eq!(tab.lookup_fast(0x1000), Some(found.host));
    }

    #[test]
    fn test_validation() {
        let mut tab = small_table();
        let code = [0x90u8; 16];
        let none: [GuestExtent; 0] = [];
        let err = tab
            .add_translation(&NewTranslation::new(0x1000, &none, &code))
            .unwrap_err();
        assert!(matches!(err, TcacheError::InvalidExtentCount(0)));

        let four = [GuestExtent::new(0x1000, 4); 4];
        let err = tab
            .add_translation(&NewTranslation::new(0x1000, &four, &code))
            .unwrap_err();
        assert!(matches!(err, TcacheError::InvalidExtentCount(4)));

        let empty = [GuestExtent::new(0x1000, 0)];
        let err = tab
            .add_translation(&NewTranslation::new(0x1000, &empty, &code))
            .unwrap_err();
        assert!(matches!(err, TcacheError::EmptyExtent { base: 0x1000 }));

        let ext = [GuestExtent::new(0x1000, 4)];
        let err = tab
            .add_translation(&NewTranslation::new(0x1000, &ext, &[]))
            .unwrap_err();
        assert!(matches!(err, TcacheError::EmptyCode));

        let huge = vec![0u8; tab.config().max_code_len() + 1];
        let err = tab
            .add_translation(&NewTranslation::new(0x1000, &ext, &huge))
            .unwrap_err();
        assert!(matches!(err, TcacheError::CodeTooLarge { .. }));

        let err = tab
            .add_translation(&NewTranslation::new(0x1000, &ext, &code).with_prof_inc_offset(12))
            .unwrap_err();
        assert!(matches!(err, TcacheError::BadProfileOffset { offset: 12, len: 16 }));

        assert_eq!(tab.resident_count(), 0);
    }

    #[test]
    fn test_rotation_recycles_oldest() {
        let mut tab = small_table();
        let usable = tab.config().usable_slots();
        let first = add(&mut tab, 0x10_0000, 16);
        for i in 1..usable as u64 {
            add(&mut tab, 0x10_0000 + i * 0x100, 16);
        }
        assert_eq!(tab.allocated_sectors(), 1);

        // Fill sector 1, then spill into sector 0 again.
        for i in 0..=usable as u64 {
            add(&mut tab, 0x20_0000 + i * 0x100, 16);
        }
        assert_eq!(tab.allocated_sectors(), 2);
        assert_eq!(tab.youngest_sector(), Some(SectorNo(0)));
        assert!(tab.record(first).is_none());
        assert!(tab.lookup_full(0x10_0000, false).is_none());
        assert_eq!(tab.stats().sectors_recycled, 1);
        assert_eq!(tab.search_order(), &[SectorNo(1), SectorNo(0)]);
    }

    #[test]
    fn test_lookup_promotes_sector() {
        let mut tab = small_table();
        let usable = tab.config().usable_slots() as u64;
        for i in 0..usable + 1 {
            add(&mut tab, 0x10_0000 + i * 0x100, 16);
        }
        assert_eq!(tab.search_order(), &[SectorNo(0), SectorNo(1)]);
        tab.lookup_full(0x10_0000 + usable * 0x100, true)
            .expect("hit in sector 1");
        assert_eq!(tab.search_order(), &[SectorNo(1), SectorNo(0)]);
    }

    #[test]
    fn test_find_by_host_addr() {
        let mut tab = small_table();
        let a = add(&mut tab, 0x1000, 24);
        let b = add(&mut tab, 0x2000, 32);
        let a_host = tab.host_addr(a).expect("live");
        let b_host = tab.host_addr(b).expect("live");
        assert_eq!(b_host - a_host, 32);

        assert_eq!(tab.find_by_host_addr(a_host), Some((a.sector, a.slot)));
        assert_eq!(tab.find_by_host_addr(a_host + 23), Some((a.sector, a.slot)));
        assert_eq!(tab.find_by_host_addr(b_host + 5), Some((b.sector, b.slot)));
        // Alignment padding between translations belongs to nobody.
        assert_eq!(tab.find_by_host_addr(a_host + 24), None);
        assert!(tab.contains_host_addr(b_host));
        assert!(!tab.contains_host_addr(b_host + 32));
    }

    #[test]
    fn test_find_by_host_addr_rejects_deleted() {
        let mut tab = small_table();
        let a = add(&mut tab, 0x1000, 32);
        let a_host = tab.host_addr(a).expect("live");
        assert_eq!(tab.invalidate_range(0x1000, 1), 1);
        assert_eq!(tab.find_by_host_addr(a_host), None);

        // The slot is reused for new code further along the arena.
        let c = add(&mut tab, 0x3000, 32);
        assert_eq!(c.slot, a.slot);
        assert_ne!(c.generation, a.generation);
        assert_eq!(tab.find_by_host_addr(a_host), None);
    }

    #[test]
    fn test_table_rehashes_under_churn() {
        let config = TcacheConfig {
            avg_translation_size: 1024,
            ..TcacheConfig::small()
        };
        let mut tab = TransTab::new(config, HeapBackend::default()).expect("valid config");
        for round in 0..1000u64 {
            add(&mut tab, 0x1000 + round * 0x10, 16);
            tab.invalidate_range(0x1000 + round * 0x10, 1);
        }
        assert!(tab.stats().table_rehashes > 0);
        assert_eq!(tab.resident_count(), 0);
        assert_eq!(tab.stats().sectors_recycled, 0);
    }
}
