//! Arena Runtime
//!
//! Memory-management runtime for compiled programs:
//! - **Stack**: segmented value stack that grows lazily and reuses segments (`stack` module)
//! - **ARC**: reference-counted heap with explicit access and release (`arc` module)
//! - **TGC**: two-semispace copying collector rooted at the stack (`gc` module)
//! - **Profiling**: JSON event logs for stack depth and heap activity (`profiling` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use arena_runtime::{RuntimeConfig, TgcRuntime};
//!
//! let mut rt = TgcRuntime::new(&RuntimeConfig::default())?;
//! let obj = rt.allocate(32, rt.base())?;
//! let sp = rt.push_value(rt.base(), Some(obj))?;
//!
//! // `obj` may move; always reload it from the stack
//! rt.collect(sp)?;
//! let obj = rt.read(sp)?.unwrap();
//!
//! let report = rt.shutdown()?;
//! assert!(report.is_clean());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Segmented value stack
pub mod stack;

/// Object references and raw slot access
pub mod object;

/// Object header layouts
pub mod header;

/// Reference-counted heap
pub mod arc;

/// Copying garbage collector
pub mod gc;

/// Runtime context tying stack, heap and profiler together
pub mod runtime;

// ============================================================================
// Ambient Modules
// ============================================================================

/// Instrumentation hooks and JSON event logs
pub mod profiling;

/// Runtime configuration
pub mod config;

/// Default sizes and limits
pub mod defaults;

/// Error types
pub mod error;

// ============================================================================
// Re-exports
// ============================================================================

pub use arc::{ArcHeap, ArcStats, ReleaseOutcome, ReleaseStep};
pub use config::{HeapConfig, ProfilingConfig, RuntimeConfig, StackConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use gc::{GcStats, TgcHeap};
pub use header::{ArcHeader, TgcHeader, TgcWord, HEADER_SIZE};
pub use object::ObjRef;
pub use profiling::{HeapEventKind, HeapRecord, JsonProfiler, NoopProfiler, Profiler, StackRecord};
pub use runtime::{ArcRuntime, Heap, Runtime, ShutdownReport, TgcRuntime};
pub use stack::{SegmentChain, StackPtr};
