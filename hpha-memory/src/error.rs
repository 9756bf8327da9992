use thiserror::Error;

/// Reasons a page/block request can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("fixed memory block exhausted")]
    Exhausted,
    #[error("capacity of {capacity} bytes would be exceeded by a {requested} byte block")]
    CapacityExceeded { requested: usize, capacity: usize },
    #[error("invalid block layout (size {size}, alignment {alignment})")]
    InvalidLayout { size: usize, alignment: usize },
    #[error("sub-allocator could not provide {0} bytes")]
    SubAllocatorFailed(usize),
    #[error("system allocator could not provide {0} bytes")]
    SystemFailed(usize),
}
