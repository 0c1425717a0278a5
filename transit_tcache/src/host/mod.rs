//! Host capabilities the cache depends on.
//!
//! The cache never touches page protections or instruction encodings
//! itself. It asks a [`HostBackend`] to map code arenas, rewrite jump
//! sites and flush the instruction cache, so the bookkeeping can be
//! exercised without a code generator.

use std::io;

use crate::types::HostAddr;

pub mod heap;
pub mod jump;
#[cfg(any(unix, windows))]
pub mod native;

pub use jump::JUMP_SITE_LEN;

/// Page granularity used to size code arenas.
pub const PAGE_SIZE: usize = 4096;

// =============================================================================
// Code Region
// =============================================================================

/// A mapped block of host memory that holds translated code.
///
/// The region's base address never changes while it is alive.
pub trait CodeRegion: Send {
    /// Host address of the first byte.
    fn base(&self) -> HostAddr;

    /// Size in bytes.
    fn capacity(&self) -> usize;

    /// Copy `bytes` into the region at `offset`.
    ///
    /// # Panics
    /// Panics if the write runs past `capacity()`.
    fn write(&mut self, offset: usize, bytes: &[u8]);

    /// Borrow `len` bytes starting at `offset`.
    fn read(&self, offset: usize, len: usize) -> &[u8];

    /// Whether `addr` lies inside the region.
    #[inline]
    fn contains(&self, addr: HostAddr) -> bool {
        addr >= self.base() && addr - self.base() < self.capacity()
    }
}

// =============================================================================
// Dispatch Stubs
// =============================================================================

/// Entry points of the generic dispatcher.
///
/// An unchained exit jumps to one of these, which looks the next guest
/// address up and possibly requests a new chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStubs {
    /// Target for exits that were chained to a slow entry point.
    pub slow: HostAddr,
    /// Target for exits that were chained to a fast entry point.
    pub fast: HostAddr,
}

// =============================================================================
// Host Backend
// =============================================================================

/// Memory mapping, patching and cache maintenance services.
pub trait HostBackend: Send {
    /// Region type handed out by `map_region`.
    type Region: CodeRegion;

    /// Map a fresh code arena of at least `bytes` bytes.
    fn map_region(&self, bytes: usize) -> io::Result<Self::Region>;

    /// Generic dispatcher entry points.
    fn dispatch_stubs(&self) -> DispatchStubs;

    /// Bytes of event-check prologue at the start of every translation.
    ///
    /// A fast entry point is the host code start plus this length.
    fn event_check_len(&self) -> usize;

    /// Make instruction fetch observe stores to `[start, start + len)`.
    fn flush_icache(&self, start: HostAddr, len: usize);

    /// Dispatcher target for an exit chained to a fast or slow entry.
    #[inline]
    fn dispatcher(&self, to_fast_entry: bool) -> HostAddr {
        let stubs = self.dispatch_stubs();
        if to_fast_entry { stubs.fast } else { stubs.slow }
    }

    /// Rewrite the jump site at `offset` in `region` to go to `target`.
    fn patch_jump(&self, region: &mut Self::Region, offset: usize, target: HostAddr) {
        let site = region.base() + offset;
        let bytes = jump::encode_jump(site, target);
        region.write(offset, &bytes);
        self.flush_icache(site, bytes.len());
    }

    /// Decode the jump site at `offset` in `region`.
    fn decode_jump(&self, region: &Self::Region, offset: usize) -> Option<HostAddr> {
        if offset + JUMP_SITE_LEN > region.capacity() {
            return None;
        }
        jump::decode_jump(region.base() + offset, region.read(offset, JUMP_SITE_LEN))
    }

    /// Store a profile counter address into the immediate at `offset`.
    fn patch_profile_counter(&self, region: &mut Self::Region, offset: usize, counter: HostAddr) {
        region.write(offset, &(counter as u64).to_le_bytes());
        self.flush_icache(region.base() + offset, 8);
    }
}
