//! Low-level building blocks shared by the `hpha` heap allocator.
//!
//! - [`BlockSource`] hands out raw, aligned pages from a fixed memory block,
//!   a delegate [`AllocatorAllocate`] or the system allocator, and enforces the
//!   capacity ceiling.
//! - [`FreeSlotList`] is the intrusive LIFO list of free slots used by pooled
//!   size classes.
//! - [`align`] holds the power-of-two alignment arithmetic.

pub mod align;
mod allocator;
#[cfg(feature = "memory_stats")]
mod allocator_stats;
mod block_source;
mod error;
mod free_slot_list;

pub use allocator::AllocatorAllocate;
#[cfg(feature = "memory_stats")]
pub use allocator_stats::{AllocatorCounters, AllocatorStats};
pub use block_source::{BlockOrigin, BlockSource, BlockSourceDesc};
pub use error::BlockError;
pub use free_slot_list::FreeSlotList;

/// Granularity of the virtual memory system the default configuration targets.
pub const OS_PAGE_SIZE: usize = 4096;
