//! Heap-backed code regions.
//!
//! `HeapBackend` gives the cache real, stable addresses without mapping
//! executable pages. Tests use it to inspect patched jump sites, and
//! embedders that only simulate execution can run on it directly.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::jump::INT3;
use super::{CodeRegion, DispatchStubs, HostBackend};
use crate::types::HostAddr;

// =============================================================================
// Heap Region
// =============================================================================

/// A code region backed by a boxed byte slice.
#[derive(Debug)]
pub struct HeapRegion {
    bytes: Box<[u8]>,
}

impl HeapRegion {
    /// Allocate `capacity` bytes filled with `int3`.
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![INT3; capacity.max(1)].into_boxed_slice(),
        }
    }
}

impl CodeRegion for HeapRegion {
    #[inline]
    fn base(&self) -> HostAddr {
        self.bytes.as_ptr() as HostAddr
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.bytes.len(),
            "write of {} bytes at {offset} overruns region",
            bytes.len()
        );
        self.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[inline]
    fn read(&self, offset: usize, len: usize) -> &[u8] {
        &self.bytes[offset..offset + len]
    }
}

// =============================================================================
// Heap Backend
// =============================================================================

/// Backend that maps regions on the heap and records cache flushes.
#[derive(Debug)]
pub struct HeapBackend {
    stubs: DispatchStubs,
    event_check_len: usize,
    /// Regions left before `map_region` starts failing.
    map_budget: AtomicUsize,
    flushes: AtomicU64,
    flushed_bytes: AtomicU64,
}

impl HeapBackend {
    /// Create a backend whose dispatcher lives at the given stubs.
    pub fn new(stubs: DispatchStubs, event_check_len: usize) -> Self {
        Self {
            stubs,
            event_check_len,
            map_budget: AtomicUsize::new(usize::MAX),
            flushes: AtomicU64::new(0),
            flushed_bytes: AtomicU64::new(0),
        }
    }

    /// Fail every `map_region` call after the first `regions`.
    pub fn with_map_limit(self, regions: usize) -> Self {
        self.map_budget.store(regions, Ordering::Relaxed);
        self
    }

    /// Number of `flush_icache` calls so far.
    #[inline]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Total bytes passed to `flush_icache`.
    #[inline]
    pub fn flushed_bytes(&self) -> u64 {
        self.flushed_bytes.load(Ordering::Relaxed)
    }
}

impl Default for HeapBackend {
    fn default() -> Self {
        Self::new(
            DispatchStubs {
                slow: 0x7000_0000,
                fast: 0x7000_0040,
            },
            0,
        )
    }
}

impl HostBackend for HeapBackend {
    type Region = HeapRegion;

    fn map_region(&self, bytes: usize) -> io::Result<HeapRegion> {
        let granted = self
            .map_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if !granted {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "heap region budget exhausted",
            ));
        }
        Ok(HeapRegion::new(bytes))
    }

    #[inline]
    fn dispatch_stubs(&self) -> DispatchStubs {
        self.stubs
    }

    #[inline]
    fn event_check_len(&self) -> usize {
        self.event_check_len
    }

    fn flush_icache(&self, _start: HostAddr, len: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}
