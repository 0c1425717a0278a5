//! Execution profile queries.
//!
//! With profiling on, every slot has an atomic counter whose address is
//! patched into translations that carry a profile increment. Counters
//! live as long as their sector and are zeroed when a slot is freed.

use std::sync::atomic::Ordering;

use super::TransTab;
use crate::host::HostBackend;
use crate::types::{GuestAddr, SlotNo, TransRef};

/// One line of profile output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileEntry {
    /// The translation.
    pub trans: TransRef,
    /// Its guest entry address.
    pub entry: GuestAddr,
    /// Times it was entered.
    pub count: u64,
    /// Weight hint supplied at translation time.
    pub weight: u32,
}

impl ProfileEntry {
    /// Ranking score: executions scaled by weight.
    #[inline]
    pub fn score(&self) -> u64 {
        self.count.saturating_mul(self.weight as u64)
    }
}

impl<B: HostBackend> TransTab<B> {
    /// The `n` live translations with the highest score, best first.
    ///
    /// Empty when profiling is off.
    pub fn profile_top(&self, n: usize) -> Vec<ProfileEntry> {
        let mut entries: Vec<ProfileEntry> = self
            .sectors
            .iter()
            .filter_map(|sector| Some((sector, sector.counters.as_ref()?)))
            .flat_map(|(sector, counters)| {
                sector
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, rec)| rec.is_in_use())
                    .map(move |(i, rec)| ProfileEntry {
                        trans: TransRef {
                            sector: sector.no,
                            slot: SlotNo(i as u16),
                            generation: rec.generation,
                        },
                        entry: rec.entry,
                        count: counters[i].load(Ordering::Relaxed),
                        weight: rec.weight,
                    })
            })
            .filter(|e| e.count > 0)
            .collect();

        entries.sort_unstable_by(|a, b| {
            b.score()
                .cmp(&a.score())
                .then_with(|| a.entry.cmp(&b.entry))
        });
        entries.truncate(n);
        entries
    }

    /// Execution count of `trans`, if it is live and profiled.
    pub fn profile_count(&self, trans: TransRef) -> Option<u64> {
        self.record(trans)?;
        let counters = self.sectors[trans.sector.index()].counters.as_ref()?;
        Some(counters[trans.slot.index()].load(Ordering::Relaxed))
    }

    /// Zero every counter.
    pub fn reset_profile(&mut self) {
        for counters in self.sectors.iter().filter_map(|s| s.counters.as_ref()) {
            for c in counters.iter() {
                c.store(0, Ordering::Relaxed);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn bump_profile(&self, trans: TransRef, by: u64) {
        if let Some(counters) = &self.sectors[trans.sector.index()].counters {
            counters[trans.slot.index()].fetch_add(by, Ordering::Relaxed);
        }
    }
}
