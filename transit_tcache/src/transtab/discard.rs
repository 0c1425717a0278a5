//! Range invalidation.

use tracing::debug;

use super::TransTab;
use crate::config::SanityLevel;
use crate::eclass::{ECLASS_MISC, range_to_class};
use crate::host::HostBackend;
use crate::stats::DiscardReason;
use crate::types::{GuestAddr, SlotNo};

impl<B: HostBackend> TransTab<B> {
    /// Delete every translation whose guest code overlaps
    /// `[start, start + len)`. Returns how many were deleted.
    ///
    /// A range inside one equivalence-class window only visits that class
    /// and the miscellaneous class of each sector; anything wider scans
    /// every slot. Either way each candidate gets an exact overlap test.
    pub fn invalidate_range(&mut self, start: GuestAddr, len: u64) -> usize {
        if len == 0 {
            return 0;
        }

        let class = range_to_class(start, len);
        let mut victims: Vec<(usize, SlotNo)> = Vec::new();
        for (s, sector) in self.sectors.iter().enumerate() {
            let hit = |slot: usize| {
                let rec = &sector.slots[slot];
                rec.is_in_use() && rec.overlaps(start, len)
            };
            if class == ECLASS_MISC {
                victims.extend(
                    (0..sector.slots.len())
                        .filter(|&i| hit(i))
                        .map(|i| (s, SlotNo(i as u16))),
                );
            } else {
                for c in [class, ECLASS_MISC] {
                    victims.extend(
                        sector
                            .eclasses
                            .live_members(c)
                            .filter(|&slot| hit(slot as usize))
                            .map(|slot| (s, SlotNo(slot))),
                    );
                }
            }
        }
        victims.sort_unstable();
        victims.dedup();

        for &(s, slot) in &victims {
            self.delete_translation(s, slot);
        }
        if !victims.is_empty() {
            self.fast.invalidate_all();
        }

        debug!(
            start = format_args!("{start:#x}"),
            len,
            class,
            deleted = victims.len(),
            "invalidated guest range"
        );

        if self.config.sanity_level >= SanityLevel::Always {
            self.assert_sane();
        }
        victims.len()
    }

    /// Invalidate a range on behalf of `reason`, counting the deletions
    /// against it.
    pub fn discard(&mut self, start: GuestAddr, len: u64, reason: DiscardReason) -> usize {
        let deleted = self.invalidate_range(start, len);
        *self.stats.discards.entry(reason).or_default() += deleted as u64;
        debug!(
            start = format_args!("{start:#x}"),
            len,
            reason = %reason,
            deleted,
            "discarded guest range"
        );
        deleted
    }
}
