//! High performance heap allocator schema.
//!
//! [`HphaSchema`] splits the heap in two:
//!
//! - a **pool allocator** for small requests (8 to 256 bytes in steps of 8),
//!   one lock and one intrusive free list per size class,
//! - a **general allocator** for everything else: boundary-tagged blocks,
//!   segregated first-fit free lists, splitting and coalescing.
//!
//! Pages for both come from a [`BlockSource`] backed by the system allocator,
//! another [`AllocatorAllocate`] or a fixed memory block. The source enforces
//! the configured capacity.
//!
//! ```
//! use hpha::{Descriptor, HphaSchema};
//!
//! let heap = HphaSchema::new(Descriptor {
//!     capacity: 16 << 20,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let small = heap.allocate(24, 8).unwrap();
//! let large = heap.allocate(64 * 1024, 64).unwrap();
//!
//! unsafe {
//!     heap.deallocate(small, 24, 8);
//!     heap.deallocate(large, 64 * 1024, 64);
//! }
//! assert_eq!(heap.num_allocated_bytes(), 0);
//! ```

mod descriptor;
mod error;
mod general;
pub mod global;
mod pool;
mod schema;

pub use descriptor::{Descriptor, MAX_ALLOCATOR_SIZE, PAGE_SIZE_GRANULARITY};
pub use error::{HeapError, Result};
pub use general::GENERAL_OVERHEAD;
pub use pool::{POOL_GRANULARITY, POOL_MAX_ALLOCATION_SIZE};
pub use schema::{AllocationRecord, DEFAULT_ALIGNMENT, HphaSchema};

#[cfg(feature = "memory_stats")]
pub use hpha_memory::AllocatorStats;
pub use hpha_memory::{AllocatorAllocate, BlockError, BlockOrigin, BlockSource};
