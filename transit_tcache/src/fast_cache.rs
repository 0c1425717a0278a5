//! Direct-mapped guest to host cache consulted before any sector.
//!
//! Each entry is guarded by a sequence counter so a dispatch loop can
//! probe it without holding the table lock. Writers are serialised by the
//! owner of the [`TransTab`](crate::TransTab); readers never block and
//! treat a concurrent update as a miss.
//!
//! Entries are overwritten, never removed one at a time. Anything that can
//! make an entry point at stale code invalidates the whole table.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};

use crate::hash_index::hash_addr;
use crate::types::{GuestAddr, HostAddr};

// =============================================================================
// Entry
// =============================================================================

#[derive(Debug, Default)]
struct Entry {
    /// Even when stable, odd while a writer is mid-update.
    seq: AtomicU32,
    guest: AtomicU64,
    /// Zero means the entry is empty.
    host: AtomicUsize,
}

impl Entry {
    fn store(&self, guest: GuestAddr, host: HostAddr) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.guest.store(guest, Ordering::Relaxed);
        self.host.store(host, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn load(&self) -> Option<(GuestAddr, HostAddr)> {
        let before = self.seq.load(Ordering::Acquire);
        if before & 1 != 0 {
            return None;
        }
        let guest = self.guest.load(Ordering::Relaxed);
        let host = self.host.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        if self.seq.load(Ordering::Relaxed) != before || host == 0 {
            return None;
        }
        Some((guest, host))
    }
}

// =============================================================================
// Fast Cache
// =============================================================================

/// A direct-mapped cache of `(guest, host)` pairs.
#[derive(Debug)]
pub struct FastCache {
    entries: Box<[Entry]>,
    bits: u32,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl FastCache {
    /// Create a cache with `2^bits` entries.
    pub fn new(bits: u32) -> Self {
        let entries = (0..1usize << bits).map(|_| Entry::default()).collect();
        Self {
            entries,
            bits,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Number of entries.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn entry(&self, guest: GuestAddr) -> &Entry {
        &self.entries[hash_addr(guest, self.bits)]
    }

    /// Probe for `guest`.
    #[inline]
    pub fn lookup(&self, guest: GuestAddr) -> Option<HostAddr> {
        match self.entry(guest).load() {
            Some((g, host)) if g == guest => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(host)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Probe without touching the hit counters.
    #[cfg(test)]
    pub(crate) fn peek(&self, guest: GuestAddr) -> Option<HostAddr> {
        match self.entry(guest).load() {
            Some((g, host)) if g == guest => Some(host),
            _ => None,
        }
    }

    /// Record `guest -> host`, evicting whatever shared its bucket.
    ///
    /// Callers must serialise inserts and invalidations.
    #[inline]
    pub(crate) fn insert(&self, guest: GuestAddr, host: HostAddr) {
        debug_assert_ne!(host, 0);
        self.entry(guest).store(guest, host);
    }

    /// Empty every entry.
    pub(crate) fn invalidate_all(&self) {
        for entry in self.entries.iter() {
            entry.store(0, 0);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// All valid pairs, for consistency checking.
    pub(crate) fn snapshot(&self) -> Vec<(GuestAddr, HostAddr)> {
        self.entries.iter().filter_map(Entry::load).collect()
    }

    /// Lookups that hit.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that missed.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Bulk invalidations.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}
