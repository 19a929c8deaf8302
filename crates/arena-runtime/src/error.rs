//! Runtime error types.

/// Errors raised by the stack, the heaps and their configuration.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The global allocator refused a segment, semispace or ARC block
    #[error("Out of memory: failed to allocate {bytes} bytes")]
    OutOfMemory {
        /// Size of the refused request
        bytes: usize,
    },

    /// A TGC allocation did not fit even after a full collection
    #[error("Heap exhausted: requested {requested} bytes with {live} of {capacity} bytes live")]
    HeapExhausted {
        /// Padded size of the failing request
        requested: usize,
        /// Live bytes in the active semispace after collecting
        live: usize,
        /// Capacity of one semispace
        capacity: usize,
    },

    /// Allocation size below the header size or beyond the 32-bit length field
    #[error("Invalid allocation size: {size}")]
    InvalidSize {
        /// Requested size
        size: usize,
    },

    /// Popped past the bottom of the stack
    #[error("Stack underflow")]
    StackUnderflow,

    /// A stack pointer that was not handed out by this segment chain
    #[error("Stack pointer {addr:#x} does not belong to this segment chain")]
    ForeignStackPointer {
        /// Address of the rejected stack pointer
        addr: usize,
    },

    /// ARC operation on an address that is not a live block of this heap
    #[error("Unknown object {addr:#x}")]
    UnknownObject {
        /// Address of the rejected object
        addr: usize,
    },

    /// TGC root or child pointing outside the active semispace
    #[error("Pointer {addr:#x} is outside the active semispace")]
    ForeignPointer {
        /// Address of the rejected pointer
        addr: usize,
    },

    /// Object header violates the layout contract
    #[error("Corrupt object at {addr:#x}: {reason}")]
    CorruptObject {
        /// Address of the offending object
        addr: usize,
        /// What is wrong with its header
        reason: String,
    },

    /// The copying heap is unusable after a failed collection
    #[error("Heap unusable after a failed collection")]
    HeapPoisoned,

    /// Child slot index past the object's pointer count
    #[error("Child index {index} out of range for {count} pointer slots")]
    ChildIndex {
        /// Requested slot
        index: usize,
        /// Pointer count stored in the header
        count: usize,
    },

    /// Invalid runtime configuration
    #[error("Config error: {0}")]
    Config(String),

    /// I/O failure (configuration files, profiling sinks)
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Runtime result
pub type RuntimeResult<T> = Result<T, RuntimeError>;
