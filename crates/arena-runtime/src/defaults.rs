//! Default constants for runtime configuration.

/// Size of one stack slot and of one embedded object pointer.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Default segment size exponent (32 slots per segment).
pub const DEFAULT_SEGMENT_BITS: u32 = 5;

/// Smallest segment that still has a usable slot between its two links.
pub const MIN_SEGMENT_BITS: u32 = 2;

/// Largest accepted segment size exponent.
pub const MAX_SEGMENT_BITS: u32 = 20;

/// Default semispace size exponent (8 KiB per semispace).
pub const DEFAULT_NURSERY_BITS: u32 = 13;

/// Smallest accepted semispace size exponent.
pub const MIN_NURSERY_BITS: u32 = 4;

/// Largest semispace whose offsets still fit a 32-bit forwarding record.
pub const MAX_NURSERY_BITS: u32 = 31;

/// Record every profiling event by default.
pub const DEFAULT_PROFILING_FREQUENCY: u64 = 1;

/// Default stack profiling log file.
pub const DEFAULT_STACK_LOG: &str = "stack_profiling.json";

/// Default heap profiling log file.
pub const DEFAULT_HEAP_LOG: &str = "heap_profiling.json";
