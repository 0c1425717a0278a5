//! A translation table shared between execution contexts.
//!
//! All mutation goes through one mutex. Dispatch loops can still probe the
//! fast cache without taking it; a miss falls back to a locked full
//! lookup.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::fast_cache::FastCache;
use crate::host::HostBackend;
use crate::transtab::TransTab;
use crate::types::{GuestAddr, HostAddr};

/// A [`TransTab`] behind a mutex, with a lock-free fast path.
pub struct SharedTransTab<B: HostBackend> {
    fast: Arc<FastCache>,
    inner: Mutex<TransTab<B>>,
}

impl<B: HostBackend> SharedTransTab<B> {
    /// Wrap a table.
    pub fn new(table: TransTab<B>) -> Self {
        Self {
            fast: Arc::clone(table.fast_cache()),
            inner: Mutex::new(table),
        }
    }

    /// Probe the fast cache without locking.
    #[inline]
    pub fn lookup_fast(&self, guest: GuestAddr) -> Option<HostAddr> {
        self.fast.lookup(guest)
    }

    /// Fast cache first, then a locked full lookup that refreshes it.
    pub fn lookup(&self, guest: GuestAddr) -> Option<HostAddr> {
        if let Some(host) = self.fast.lookup(guest) {
            return Some(host);
        }
        self.inner.lock().lookup_full(guest, true).map(|f| f.host)
    }

    /// Lock the table for any other operation.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, TransTab<B>> {
        self.inner.lock()
    }

    /// Unwrap the table.
    pub fn into_inner(self) -> TransTab<B> {
        self.inner.into_inner()
    }
}

impl<B: HostBackend> std::fmt::Debug for SharedTransTab<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTransTab")
            .field("fast_entries", &self.fast.capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GuestExtent, HeapBackend, NewTranslation, TcacheConfig};
    use std::thread;

    fn shared() -> Arc<SharedTransTab<HeapBackend>> {
        let config = TcacheConfig {
            slots_per_sector: 512,
            ..TcacheConfig::small()
        };
        let table = TransTab::new(config, HeapBackend::default()).expect("valid config");
        Arc::new(SharedTransTab::new(table))
    }

    #[test]
    fn test_lookup_falls_back_to_full() {
        let tab = shared();
        let extents = [GuestExtent::new(0x1000, 4)];
        let host = {
            let mut t = tab.lock();
            let r = t
                .add_translation(&NewTranslation::new(0x1000, &extents, &[0x90; 16]))
                .expect("add");
            // Force the fast path to miss.
            t.fast_cache().invalidate_all();
            t.host_addr(r).expect("live")
        };

        assert_eq!(tab.lookup_fast(0x1000), None);
        assert_eq!(tab.lookup(0x1000), Some(host));
        assert_eq!(tab.lookup_fast(0x1000), Some(host));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let tab = shared();
        let writer = {
            let tab = Arc::clone(&tab);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let guest = 0x10_000 + i * 0x40;
                    let extents = [GuestExtent::new(guest, 4)];
                    let code = [0x90u8; 32];
                    tab.lock()
                        .add_translation(&NewTranslation::new(guest, &extents, &code))
                        .expect("add");
                    if i % 50 == 49 {
                        tab.lock().invalidate_range(0x10_000, i * 0x40);
                    }
                }
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let tab = Arc::clone(&tab);
                thread::spawn(move || {
                    for _ in 0..50 {
                        for i in 0..200u64 {
                            let guest = 0x10_000 + i * 0x40;
                            if let Some(host) = tab.lookup_fast(guest) {
                                // A fast hit must always point into some arena.
                                assert!(tab.lock().contains_host_addr(host));
                            }
                        }
                    }
                })
            })
            .collect();

        writer.join().expect("writer panicked");
        for r in readers {
            r.join().expect("reader panicked");
        }
        assert_eq!(tab.lock().sanity_check(), Ok(()));
    }
}
