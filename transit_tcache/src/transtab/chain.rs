//! Chaining: patching exits to jump straight to other translations.
//!
//! Every patched jump is recorded as an `OutEdge` on the translation that
//! holds it and an `InEdge` on its target. Deleting either end undoes the
//! edge; deleting the target also rewrites the jump back to the generic
//! dispatcher so no live code can reach freed memory.

use tracing::trace;

use super::TransTab;
use crate::config::SanityLevel;
use crate::host::{HostBackend, JUMP_SITE_LEN};
use crate::record::{InEdge, OutEdge};
use crate::types::{HostAddr, SectorNo, SlotNo, TransRef};

/// Result of a chain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The jump now goes directly to the target.
    Chained,
    /// Nothing was patched. Execution keeps going through the dispatcher,
    /// which will ask again if the exit stays hot.
    Dropped(DropReason),
}

/// Why a chain request was ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The target was deleted after the request was made.
    StaleTarget,
    /// No live translation owns the patch site.
    StaleSource,
    /// The patch site does not leave room for a jump inside its owner.
    BadSite,
}

impl<B: HostBackend> TransTab<B> {
    /// Patch the jump at `patch_site` to enter `target` directly.
    ///
    /// `to_fast_entry` skips the target's event-check prologue. A site
    /// that is already chained is first unlinked from its old target.
    pub fn chain(&mut self, patch_site: HostAddr, target: TransRef, to_fast_entry: bool) -> ChainOutcome {
        let Some(target_host) = self.host_addr(target) else {
            return self.drop_chain(patch_site, DropReason::StaleTarget);
        };
        let dest = if to_fast_entry {
            target_host + self.backend.event_check_len()
        } else {
            target_host
        };

        let Some((src_no, src_slot)) = self.find_by_host_addr(patch_site) else {
            return self.drop_chain(patch_site, DropReason::StaleSource);
        };
        let (s, src) = (src_no.index(), src_slot);

        let sector = &self.sectors[s];
        let rec = &sector.slots[src.index()];
        let site_offset = patch_site - sector.host_addr(rec.host_offset);
        if site_offset + JUMP_SITE_LEN > rec.host_len as usize {
            return self.drop_chain(patch_site, DropReason::BadSite);
        }
        let site_offset = site_offset as u32;
        let region_offset = rec.host_offset as usize + site_offset as usize;

        if let Some(old) = rec.out_edge_at(site_offset) {
            self.sectors[s].slots[src.index()].remove_out_edge(old.to_sector, old.to_slot, site_offset);
            self.sectors[old.to_sector.index()].slots[old.to_slot.index()]
                .remove_in_edge(src_no, src, site_offset);
        }

        self.backend
            .patch_jump(&mut self.sectors[s].region, region_offset, dest);

        self.sectors[s].slots[src.index()].out_edges.push(OutEdge {
            to_sector: target.sector,
            to_slot: target.slot,
            from_offset: site_offset,
            to_fast_entry,
        });
        self.sectors[target.sector.index()].slots[target.slot.index()]
            .in_edges
            .push(InEdge {
                from_sector: src_no,
                from_slot: src,
                from_offset: site_offset,
                to_fast_entry,
            });
        self.stats.chains += 1;

        trace!(
            from = %TransRefDisplay(src_no, src),
            site = site_offset,
            to = %target,
            fast = to_fast_entry,
            "chained"
        );

        if self.config.sanity_level >= SanityLevel::Always {
            self.assert_sane();
        }
        ChainOutcome::Chained
    }

    fn drop_chain(&mut self, patch_site: HostAddr, reason: DropReason) -> ChainOutcome {
        self.stats.chains_dropped += 1;
        trace!(
            site = format_args!("{patch_site:#x}"),
            reason = ?reason,
            "chain request dropped"
        );
        ChainOutcome::Dropped(reason)
    }

    /// Undo every edge touching `(s, slot)`.
    ///
    /// Jumps into this translation are pointed back at the dispatcher and
    /// their out-edges removed; this translation's own out-edges are
    /// removed from their targets. Afterwards nothing refers to the slot.
    pub(crate) fn unchain_for_deletion(&mut self, s: usize, slot: SlotNo) {
        let me = SectorNo(s as u16);
        let rec = &mut self.sectors[s].slots[slot.index()];
        let in_edges = std::mem::take(&mut rec.in_edges);
        let out_edges = std::mem::take(&mut rec.out_edges);

        for edge in &in_edges {
            let is_self = edge.from_sector == me && edge.from_slot == slot;
            let dispatcher = self.backend.dispatcher(edge.to_fast_entry);
            let source = &mut self.sectors[edge.from_sector.index()];
            let offset =
                source.slots[edge.from_slot.index()].host_offset as usize + edge.from_offset as usize;
            self.backend.patch_jump(&mut source.region, offset, dispatcher);
            if !is_self {
                source.slots[edge.from_slot.index()].remove_out_edge(me, slot, edge.from_offset);
            }
            self.stats.unchains += 1;
        }

        for edge in &out_edges {
            if edge.to_sector == me && edge.to_slot == slot {
                continue;
            }
            self.sectors[edge.to_sector.index()].slots[edge.to_slot.index()]
                .remove_in_edge(me, slot, edge.from_offset);
        }

        if !in_edges.is_empty() || !out_edges.is_empty() {
            trace!(
                trans = %TransRefDisplay(me, slot),
                unpatched = in_edges.len(),
                dropped_out = out_edges.len(),
                "unchained for deletion"
            );
        }
    }
}

/// `sector:slot` without a generation, for log fields.
struct TransRefDisplay(SectorNo, SlotNo);

impl std::fmt::Display for TransRefDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}
