//! Self-check of the translation table's invariants.
//!
//! A failure here means the table is already corrupt: some index names a
//! dead slot, or some patched jump may lead into freed code. There is no
//! recovery, so [`TransTab::assert_sane`] logs the table state and panics.

use std::fmt::Write as _;

use thiserror::Error;
use tracing::error;

use crate::eclass::classes_of;
use crate::host::{CodeRegion, HostBackend};
use crate::record::TransRecord;
use crate::transtab::TransTab;
use crate::types::{GuestAddr, HostAddr, SectorNo, SlotNo};

/// A broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanityError {
    /// The search order is not a permutation of the allocated sectors.
    #[error("search order {order:?} is not a permutation of allocated sectors {allocated:?}")]
    SearchOrder {
        /// Current order.
        order: Vec<SectorNo>,
        /// Allocated sectors.
        allocated: Vec<SectorNo>,
    },

    /// An in-use record's class links disagree with its extents.
    #[error("{sector}:{slot}: registered classes {registered:?}, extents give {expected:?}")]
    EclassMembership {
        /// Sector.
        sector: SectorNo,
        /// Slot.
        slot: SlotNo,
        /// Classes the record is registered in.
        registered: Vec<u16>,
        /// Classes derived from its extents.
        expected: Vec<u16>,
    },

    /// A class link does not point back at its record.
    #[error("{sector}:{slot}: class {class} index {index} does not name this slot")]
    EclassBacklink {
        /// Sector.
        sector: SectorNo,
        /// Slot.
        slot: SlotNo,
        /// Class number.
        class: u16,
        /// Index within the class.
        index: u32,
    },

    /// A class array names a slot that is not in use or not linked back.
    #[error("{sector}: class {class} index {index} holds stale slot {slot}")]
    EclassStale {
        /// Sector.
        sector: SectorNo,
        /// Class number.
        class: u16,
        /// Index within the class.
        index: u32,
        /// Slot named.
        slot: SlotNo,
    },

    /// An in-use record cannot be found through its lookup table.
    #[error("{sector}:{slot}: entry {entry:#x} not reachable through the lookup table")]
    TableMissing {
        /// Sector.
        sector: SectorNo,
        /// Slot.
        slot: SlotNo,
        /// Guest entry address.
        entry: GuestAddr,
    },

    /// The lookup table names a slot that is not in use.
    #[error("{sector}: lookup table holds {slot}, which is not in use")]
    TableStale {
        /// Sector.
        sector: SectorNo,
        /// Slot.
        slot: SlotNo,
    },

    /// Lookup table occupancy disagrees with the slot table.
    #[error("{sector}: lookup table has {live} live buckets, {in_use} slots in use")]
    TableCount {
        /// Sector.
        sector: SectorNo,
        /// Live buckets.
        live: usize,
        /// Slots in use.
        in_use: usize,
    },

    /// The host extent list does not describe an in-use record.
    #[error("{sector}:{slot}: host extent missing or mismatched")]
    HostExtent {
        /// Sector.
        sector: SectorNo,
        /// Slot.
        slot: SlotNo,
    },

    /// An edge has no partner, or more than one.
    #[error("{sector}:{slot}: {detail}")]
    EdgeAsymmetry {
        /// Sector.
        sector: SectorNo,
        /// Slot.
        slot: SlotNo,
        /// What is wrong.
        detail: String,
    },

    /// Slot accounting does not add up.
    #[error("{sector}: {in_use} in use + {free} free != {slots} slots")]
    FreeList {
        /// Sector.
        sector: SectorNo,
        /// Slots in use.
        in_use: usize,
        /// Slots on the free list.
        free: usize,
        /// Slot table size.
        slots: usize,
    },

    /// The bump pointer ran past the arena.
    #[error("{sector}: {used} code bytes used of {capacity}")]
    CodeOverrun {
        /// Sector.
        sector: SectorNo,
        /// Bytes used.
        used: usize,
        /// Arena size.
        capacity: usize,
    },

    /// The fast cache maps an address differently from the full lookup.
    #[error("fast cache maps {guest:#x} to {fast:#x}, full lookup gives {full:?}")]
    FastCacheStale {
        /// Guest address.
        guest: GuestAddr,
        /// Host address in the fast cache.
        fast: HostAddr,
        /// Host address from the sectors.
        full: Option<HostAddr>,
    },
}

impl<B: HostBackend> TransTab<B> {
    /// Verify every structural invariant of the table.
    pub fn sanity_check(&self) -> Result<(), SanityError> {
        let allocated: Vec<SectorNo> = self.sectors.iter().map(|s| s.no).collect();
        if !self.order.is_permutation_of(&allocated) {
            return Err(SanityError::SearchOrder {
                order: self.order.as_slice().to_vec(),
                allocated,
            });
        }

        for s in 0..self.sectors.len() {
            self.check_sector(s)?;
        }
        self.check_edges()?;

        for (guest, fast) in self.fast.snapshot() {
            let full = self.locate(guest).map(|(_, s, slot)| {
                let sector = &self.sectors[s];
                sector.host_addr(sector.slots[slot.index()].host_offset)
            });
            if full != Some(fast) {
                return Err(SanityError::FastCacheStale { guest, fast, full });
            }
        }
        Ok(())
    }

    fn check_sector(&self, s: usize) -> Result<(), SanityError> {
        let sector = &self.sectors[s];
        let no = sector.no;

        if sector.code_used > sector.region.capacity() {
            return Err(SanityError::CodeOverrun {
                sector: no,
                used: sector.code_used,
                capacity: sector.region.capacity(),
            });
        }

        let in_use = sector.slots.iter().filter(|r| r.is_in_use()).count();
        let free = sector.free_list_len();
        if in_use != sector.in_use || in_use + free != sector.slots.len() {
            return Err(SanityError::FreeList {
                sector: no,
                in_use: sector.in_use,
                free,
                slots: sector.slots.len(),
            });
        }

        if sector.table.live() != in_use {
            return Err(SanityError::TableCount {
                sector: no,
                live: sector.table.live(),
                in_use,
            });
        }
        if let Some(slot) = sector
            .table
            .occupied()
            .find(|slot| !sector.slots[slot.index()].is_in_use())
        {
            return Err(SanityError::TableStale { sector: no, slot });
        }

        for (class, index, slot) in sector.eclasses.entries() {
            let rec = &sector.slots[slot as usize];
            let linked = rec
                .eclasses
                .iter()
                .any(|l| l.class == class && l.index == index);
            if !rec.is_in_use() || !linked {
                return Err(SanityError::EclassStale {
                    sector: no,
                    class,
                    index,
                    slot: SlotNo(slot),
                });
            }
        }

        for (i, rec) in sector.slots.iter().enumerate() {
            let slot = SlotNo(i as u16);
            if !rec.is_in_use() {
                if !rec.eclasses.is_empty() || !rec.in_edges.is_empty() || !rec.out_edges.is_empty()
                {
                    return Err(SanityError::EdgeAsymmetry {
                        sector: no,
                        slot,
                        detail: "dead slot still carries links".to_string(),
                    });
                }
                continue;
            }

            let registered: Vec<u16> = rec.eclasses.iter().map(|l| l.class).collect();
            let expected: Vec<u16> = classes_of(&rec.extents).to_vec();
            if registered != expected {
                return Err(SanityError::EclassMembership {
                    sector: no,
                    slot,
                    registered,
                    expected,
                });
            }
            for link in &rec.eclasses {
                if sector.eclasses.members(link.class).get(link.index as usize) != Some(&slot.0) {
                    return Err(SanityError::EclassBacklink {
                        sector: no,
                        slot,
                        class: link.class,
                        index: link.index,
                    });
                }
            }

            if sector.table.find(rec.entry, &sector.slots) != Some(slot) {
                return Err(SanityError::TableMissing {
                    sector: no,
                    slot,
                    entry: rec.entry,
                });
            }

            let ext = sector.host_extents.find(rec.host_offset);
            if ext.is_none_or(|e| e.slot != slot || e.start != rec.host_offset || e.len != rec.host_len)
            {
                return Err(SanityError::HostExtent { sector: no, slot });
            }
        }
        Ok(())
    }

    fn check_edges(&self) -> Result<(), SanityError> {
        for sector in &self.sectors {
            for (i, rec) in sector.slots.iter().enumerate() {
                let slot = SlotNo(i as u16);
                let fail = |detail: String| SanityError::EdgeAsymmetry {
                    sector: sector.no,
                    slot,
                    detail,
                };

                for e in &rec.in_edges {
                    let Some(src) = self.live_record(e.from_sector, e.from_slot) else {
                        return Err(fail(format!(
                            "in-edge from dead {}:{}",
                            e.from_sector, e.from_slot
                        )));
                    };
                    let matches = src
                        .out_edges
                        .iter()
                        .filter(|o| {
                            o.to_sector == sector.no
                                && o.to_slot == slot
                                && o.from_offset == e.from_offset
                                && o.to_fast_entry == e.to_fast_entry
                        })
                        .count();
                    if matches != 1 {
                        return Err(fail(format!(
                            "in-edge from {}:{}+{} has {matches} matching out-edges",
                            e.from_sector, e.from_slot, e.from_offset
                        )));
                    }
                }

                for o in &rec.out_edges {
                    let Some(dst) = self.live_record(o.to_sector, o.to_slot) else {
                        return Err(fail(format!(
                            "out-edge to dead {}:{}",
                            o.to_sector, o.to_slot
                        )));
                    };
                    let matches = dst
                        .in_edges
                        .iter()
                        .filter(|e| {
                            e.from_sector == sector.no
                                && e.from_slot == slot
                                && e.from_offset == o.from_offset
                                && e.to_fast_entry == o.to_fast_entry
                        })
                        .count();
                    if matches != 1 {
                        return Err(fail(format!(
                            "out-edge at +{} to {}:{} has {matches} matching in-edges",
                            o.from_offset, o.to_sector, o.to_slot
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn live_record(&self, sector: SectorNo, slot: SlotNo) -> Option<&TransRecord> {
        let rec = self.sectors.get(sector.index())?.slots.get(slot.index())?;
        rec.is_in_use().then_some(rec)
    }

    /// Run [`sanity_check`](Self::sanity_check) and panic with a state
    /// dump if it fails.
    pub fn assert_sane(&self) {
        if let Err(err) = self.sanity_check() {
            let dump = self.dump_state();
            error!(error = %err, state = %dump, "translation table invariant violated");
            panic!("translation table invariant violated: {err}\n{dump}");
        }
    }

    /// Human-readable summary of every sector.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "youngest={:?} order={:?}",
            self.youngest,
            self.order.as_slice()
        );
        for sector in &self.sectors {
            let _ = writeln!(
                out,
                "  {}: in_use={} code={}/{} table={}+{}t recycles={}",
                sector.no,
                sector.in_use,
                sector.code_used,
                sector.region.capacity(),
                sector.table.live(),
                sector.table.tombstones(),
                sector.recycles,
            );
            for (i, rec) in sector.slots.iter().enumerate().filter(|(_, r)| r.is_in_use()) {
                let _ = writeln!(
                    out,
                    "    t{i}: entry={:#x} host=+{:#x}/{} in={} out={}",
                    rec.entry,
                    rec.host_offset,
                    rec.host_len,
                    rec.in_edges.len(),
                    rec.out_edges.len(),
                );
            }
        }
        out
    }
}
