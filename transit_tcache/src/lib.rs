//! Translated-code cache for the Transit instrumentation engine.
//!
//! The cache stores host machine code produced by the translator, indexes
//! it by guest entry address, links translations together by patching
//! their exit jumps, and throws translations away when the guest code
//! they were built from changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ TransTab                                                             │
//! │                                                                      │
//! │  FastCache (direct-mapped guest -> host, lock-free reads)            │
//! │      │ miss                                                          │
//! │      ▼                                                               │
//! │  SearchOrder ──▶ Sector 0   Sector 1   ...   Sector N-1              │
//! │                  ├── code arena (bump allocated, mapped by backend)  │
//! │                  ├── slot table (TransRecord, free list)             │
//! │                  ├── LookupTable (open addressing, tombstones)       │
//! │                  ├── EclassIndex (spatial index for invalidation)    │
//! │                  └── HostExtents (host address -> slot)              │
//! │                                                                      │
//! │  Chain graph: InEdge/OutEdge pairs between records, addressed by     │
//! │  (sector, slot) so a recycled sector invalidates them in bulk.       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sectors fill round-robin. When the youngest sector runs out of code
//! space or slots the next one becomes youngest, and if it was already in
//! use every translation in it is unchained and erased at once.
//!
//! # Concurrency
//!
//! `TransTab` is single-writer and takes `&mut self` for every mutation.
//! Embedders that run several execution contexts wrap it in
//! [`SharedTransTab`], which serialises all entry points behind one mutex
//! while still letting dispatch loops probe the fast cache without it.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod config;
pub mod eclass;
pub mod error;
pub mod fast_cache;
pub mod host;
pub mod record;
pub mod shared;
pub mod stats;
pub mod transtab;
pub mod types;

mod hash_index;
mod host_extents;
mod sanity;
mod search_order;
mod sector;

pub use config::{ConfigError, SanityLevel, TcacheConfig};
pub use error::TcacheError;
pub use fast_cache::FastCache;
pub use host::heap::{HeapBackend, HeapRegion};
#[cfg(any(unix, windows))]
pub use host::native::{NativeBackend, NativeRegion};
pub use host::{CodeRegion, DispatchStubs, HostBackend};
pub use record::{InEdge, OutEdge, SlotStatus, TransRecord};
pub use sanity::SanityError;
pub use shared::SharedTransTab;
pub use stats::{DiscardReason, TcacheStats};
pub use transtab::{ChainOutcome, DropReason, ProfileEntry, TransTab};
pub use types::{
    FoundTranslation, GuestAddr, GuestExtent, HostAddr, NewTranslation, SectorNo, SlotNo,
    TransRef,
};
