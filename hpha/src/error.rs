use hpha_memory::BlockError;
use thiserror::Error;

/// Errors reported by the heap schema.
///
/// The null-returning API (`allocate`, `reallocate`) folds these into `None`;
/// the `try_*` variants surface them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// No memory could be found or acquired for the request.
    #[error("out of memory")]
    OutOfMemory,
    /// The request alone is larger than the schema's capacity.
    #[error("request of {requested} bytes exceeds capacity of {capacity} bytes")]
    CapacityExceeded { requested: usize, capacity: usize },
    /// Alignment is not a power of two.
    #[error("invalid alignment {0} (must be a power of two)")]
    InvalidAlignment(usize),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(&'static str),
    /// Pointer is not owned by this schema.
    #[error("pointer {0:#x} is not owned by this heap")]
    InvalidPointer(usize),
    #[error("double free of {0:#x}")]
    DoubleFree(usize),
    #[error("a default heap is already installed")]
    AlreadyInstalled,
    #[error(transparent)]
    Block(#[from] BlockError),
}

pub type Result<T> = std::result::Result<T, HeapError>;
