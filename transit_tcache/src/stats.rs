//! Translation table statistics.

use std::fmt;

use rustc_hash::FxHashMap;

/// Why a guest range was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscardReason {
    /// The guest wrote to its own code.
    SelfModifyingCode,
    /// The guest unmapped the range.
    Unmap,
    /// The range lost execute permission.
    Protection,
    /// The instrumentation tool asked for it.
    ClientRequest,
}

impl DiscardReason {
    /// Short name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::SelfModifyingCode => "smc",
            DiscardReason::Unmap => "unmap",
            DiscardReason::Protection => "mprotect",
            DiscardReason::ClientRequest => "client",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters describing table activity since creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcacheStats {
    /// Translations added.
    pub translations_added: u64,
    /// Translations deleted individually (not by recycling).
    pub translations_deleted: u64,
    /// Bytes of host code copied in.
    pub code_bytes: u64,
    /// Full lookups performed.
    pub full_lookups: u64,
    /// Full lookups that found a translation.
    pub full_hits: u64,
    /// Fast cache hits.
    pub fast_hits: u64,
    /// Fast cache misses.
    pub fast_misses: u64,
    /// Jumps chained.
    pub chains: u64,
    /// Chain requests dropped because an endpoint was gone.
    pub chains_dropped: u64,
    /// Chained jumps restored to the dispatcher.
    pub unchains: u64,
    /// Translations removed by discard requests, per reason.
    pub discards: FxHashMap<DiscardReason, u64>,
    /// Sectors recycled.
    pub sectors_recycled: u64,
    /// Fast cache bulk invalidations.
    pub fast_invalidations: u64,
    /// Lookup table rebuilds triggered by tombstones.
    pub table_rehashes: u64,
}

impl TcacheStats {
    /// Translations discarded for `reason`.
    pub fn discarded(&self, reason: DiscardReason) -> u64 {
        self.discards.get(&reason).copied().unwrap_or(0)
    }

    /// Full lookup hit ratio, 0 when nothing was looked up.
    pub fn full_hit_rate(&self) -> f64 {
        if self.full_lookups == 0 {
            0.0
        } else {
            self.full_hits as f64 / self.full_lookups as f64
        }
    }

    /// Fast cache hit ratio, 0 when nothing was looked up.
    pub fn fast_hit_rate(&self) -> f64 {
        let total = self.fast_hits + self.fast_misses;
        if total == 0 {
            0.0
        } else {
            self.fast_hits as f64 / total as f64
        }
    }
}
