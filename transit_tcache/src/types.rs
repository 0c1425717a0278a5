//! Address and handle types shared across the cache.

use std::fmt;

/// An address in the instrumented program's address space.
pub type GuestAddr = u64;

/// An address in the engine's own address space (host machine code).
pub type HostAddr = usize;

// =============================================================================
// Sector / Slot Numbers
// =============================================================================

/// Index of a sector in the translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorNo(pub u16);

impl SectorNo {
    /// Get the index as usize.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Index of a translation record within its sector's slot table.
///
/// `0xFFFF` and `0xFFFE` are never valid slots: the lookup table and the
/// equivalence-class arrays use them as empty and tombstone markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotNo(pub u16);

impl SlotNo {
    /// Largest number of slots a sector can hold.
    pub const MAX_SLOTS: usize = 0xFFFE;

    /// Get the index as usize.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// =============================================================================
// Guest Extents
// =============================================================================

/// A contiguous range of guest code covered by a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestExtent {
    /// First guest byte.
    pub base: GuestAddr,
    /// Number of bytes.
    pub len: u32,
}

impl GuestExtent {
    /// Create a new extent.
    #[inline]
    pub const fn new(base: GuestAddr, len: u32) -> Self {
        Self { base, len }
    }

    /// Exclusive end address, saturating at the top of the address space.
    #[inline]
    pub const fn end(&self) -> GuestAddr {
        self.base.saturating_add(self.len as u64)
    }

    /// Last byte covered. Meaningless for empty extents.
    #[inline]
    pub const fn last(&self) -> GuestAddr {
        self.base.saturating_add((self.len as u64).saturating_sub(1))
    }

    /// Whether this extent shares at least one byte with `[start, start + len)`.
    #[inline]
    pub fn overlaps(&self, start: GuestAddr, len: u64) -> bool {
        if self.len == 0 || len == 0 {
            return false;
        }
        let ext_end = self.base as u128 + self.len as u128;
        let range_end = start as u128 + len as u128;
        (self.base as u128) < range_end && (start as u128) < ext_end
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Handle to a live translation.
///
/// `generation` is the slot's reuse counter when the handle was minted.
/// Deleting the translation or recycling its sector bumps the counter, so
/// a handle that outlives its translation is detected rather than
/// silently aliasing whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransRef {
    /// Owning sector.
    pub sector: SectorNo,
    /// Slot within the sector.
    pub slot: SlotNo,
    /// Slot generation at creation time.
    pub generation: u32,
}

impl fmt::Display for TransRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.sector, self.slot, self.generation)
    }
}

/// Result of a successful full lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundTranslation {
    /// Start of the translation's host code (its slow entry point).
    pub host: HostAddr,
    /// Handle to the translation.
    pub trans: TransRef,
}

// =============================================================================
// New Translation
// =============================================================================

/// A finished translation handed to the cache by the translator.
#[derive(Debug, Clone, Copy)]
pub struct NewTranslation<'a> {
    /// Guest address execution enters at.
    pub entry: GuestAddr,
    /// Guest code covered (1 to 3 extents).
    pub extents: &'a [GuestExtent],
    /// Host machine code.
    pub code: &'a [u8],
    /// Offset in `code` of the profile counter address immediate, if any.
    pub prof_inc_offset: Option<u32>,
    /// Relative cost estimate used to rank profile output.
    pub weight: u32,
}

impl<'a> NewTranslation<'a> {
    /// Create a translation with unit weight and no profile counter.
    pub fn new(entry: GuestAddr, extents: &'a [GuestExtent], code: &'a [u8]) -> Self {
        Self {
            entry,
            extents,
            code,
            prof_inc_offset: None,
            weight: 1,
        }
    }

    /// Set the weight hint.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the profile counter patch offset.
    pub fn with_prof_inc_offset(mut self, offset: u32) -> Self {
        self.prof_inc_offset = Some(offset);
        self
    }
}
