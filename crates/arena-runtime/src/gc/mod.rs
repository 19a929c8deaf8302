//! Tracing copying garbage collector
//!
//! # Architecture
//!
//! - **Two semispaces**: `active` receives bump allocations, `copy` receives
//!   survivors during a collection. The roles swap after every collection.
//!
//! - **Stack roots**: the root set is every occupied slot of the segment
//!   chain. Nothing else may hold a pointer into this heap across an
//!   allocation.
//!
//! - **Forwarding records**: a copied object's old header is overwritten with
//!   the `0xFFFF_FFFF` sentinel and the offset of its copy, which makes shared
//!   and cyclic structures safe to trace.
//!
//! - **Exhaustion policy**: a request that does not fit after a full
//!   collection fails with [`crate::RuntimeError::HeapExhausted`].

pub mod collector;
pub mod heap;
pub mod semispace;

pub use collector::GcStats;
pub use heap::{Objects, TgcHeap};
pub use semispace::Semispace;
