//! Reference-counted heap
//!
//! Blocks come from the global allocator and carry an [`ArcHeader`]. A block
//! is freed the moment its count drops to zero; its embedded pointers are
//! released afterwards through an explicit worklist, so arbitrarily deep
//! structures never grow the native call stack.
//!
//! Cyclic structures are never reclaimed. They stay live until the heap is
//! closed, where they show up in the shutdown report.

use crate::error::{RuntimeError, RuntimeResult};
use crate::header::{min_object_len, ArcHeader, HEADER_SIZE};
use crate::object::ObjRef;
use crate::runtime::ShutdownReport;
use rustc_hash::FxHashMap;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

const BLOCK_ALIGN: usize = 8;

/// Result of a [`ArcHeap::release`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Objects freed by this release, the released object included
    pub freed_objects: usize,

    /// Bytes returned to the allocator
    pub freed_bytes: usize,
}

/// One step of a release walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStep {
    /// A count was decremented
    Dropped {
        /// Object whose count dropped
        obj: ObjRef,
        /// Count left after the decrement
        refcount: u32,
    },
    /// A block reached zero and went back to the allocator
    Freed {
        /// Freed object, no longer valid
        obj: ObjRef,
        /// Size of the block
        bytes: usize,
    },
}

/// Allocation counters
#[derive(Debug, Clone, Default)]
pub struct ArcStats {
    /// Blocks allocated over the heap's lifetime
    pub allocations: usize,

    /// Blocks freed over the heap's lifetime
    pub frees: usize,

    /// Bytes allocated over the heap's lifetime
    pub allocated_bytes: usize,

    /// Bytes freed over the heap's lifetime
    pub freed_bytes: usize,
}

/// Reference-counted heap
pub struct ArcHeap {
    /// Live blocks and their sizes
    blocks: FxHashMap<ObjRef, usize>,

    /// Total bytes held by live blocks
    live_bytes: usize,

    /// Statistics
    stats: ArcStats,
}

impl ArcHeap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self {
            blocks: FxHashMap::default(),
            live_bytes: 0,
            stats: ArcStats::default(),
        }
    }

    /// Allocate a zeroed block of `size` bytes
    ///
    /// The block starts with a zero reference count and no embedded
    /// pointers. Set the pointer count with [`ArcHeap::set_header`] before
    /// storing children.
    pub fn allocate(&mut self, size: usize) -> RuntimeResult<ObjRef> {
        if size < HEADER_SIZE {
            return Err(RuntimeError::InvalidSize { size });
        }
        let layout = Layout::from_size_align(size, BLOCK_ALIGN)
            .map_err(|_| RuntimeError::InvalidSize { size })?;

        let ptr = unsafe { alloc_zeroed(layout) };
        let obj = NonNull::new(ptr)
            .map(ObjRef::new)
            .ok_or(RuntimeError::OutOfMemory { bytes: size })?;

        self.blocks.insert(obj, size);
        self.live_bytes += size;
        self.stats.allocations += 1;
        self.stats.allocated_bytes += size;
        Ok(obj)
    }

    /// Size of a live block
    pub fn size_of(&self, obj: ObjRef) -> RuntimeResult<usize> {
        self.blocks
            .get(&obj)
            .copied()
            .ok_or(RuntimeError::UnknownObject { addr: obj.addr() })
    }

    /// Check whether `obj` is a live block of this heap
    pub fn contains(&self, obj: ObjRef) -> bool {
        self.blocks.contains_key(&obj)
    }

    /// Read the header of a live block
    pub fn header(&self, obj: ObjRef) -> RuntimeResult<ArcHeader> {
        self.size_of(obj)?;
        Ok(ArcHeader::decode(&unsafe { obj.read_header() }))
    }

    /// Overwrite the header of a live block
    ///
    /// Fails if the pointer slots implied by `header` do not fit the block.
    pub fn set_header(&mut self, obj: ObjRef, header: ArcHeader) -> RuntimeResult<()> {
        let size = self.size_of(obj)?;
        if min_object_len(header.pointer_count) > size {
            return Err(RuntimeError::CorruptObject {
                addr: obj.addr(),
                reason: format!(
                    "{} pointer slots do not fit a {} byte block",
                    header.pointer_count, size
                ),
            });
        }
        unsafe { obj.write_header(header.encode()) };
        Ok(())
    }

    fn checked_slot(&self, obj: ObjRef, index: usize) -> RuntimeResult<()> {
        let count = self.header(obj)?.pointer_count as usize;
        if index >= count {
            return Err(RuntimeError::ChildIndex { index, count });
        }
        Ok(())
    }

    /// Read embedded pointer `index`
    pub fn child(&self, obj: ObjRef, index: usize) -> RuntimeResult<Option<ObjRef>> {
        self.checked_slot(obj, index)?;
        Ok(unsafe { obj.read_child(index) })
    }

    /// Store embedded pointer `index`
    ///
    /// Ownership moves into the slot: the caller is expected to have
    /// accounted for the reference with [`ArcHeap::access`].
    pub fn set_child(
        &mut self,
        obj: ObjRef,
        index: usize,
        child: Option<ObjRef>,
    ) -> RuntimeResult<()> {
        self.checked_slot(obj, index)?;
        if let Some(child) = child {
            self.size_of(child)?;
        }
        unsafe { obj.write_child(index, child) };
        Ok(())
    }

    /// Bytes after the pointer slots
    pub fn payload(&self, obj: ObjRef) -> RuntimeResult<&[u8]> {
        let size = self.size_of(obj)?;
        let start = min_object_len(self.header(obj)?.pointer_count).min(size);
        Ok(unsafe { obj.bytes(start, size) })
    }

    /// Mutable bytes after the pointer slots
    pub fn payload_mut(&mut self, obj: ObjRef) -> RuntimeResult<&mut [u8]> {
        let size = self.size_of(obj)?;
        let start = min_object_len(self.header(obj)?.pointer_count).min(size);
        Ok(unsafe { obj.bytes_mut(start, size) })
    }

    /// Take a reference; returns the new count
    pub fn access(&mut self, obj: ObjRef) -> RuntimeResult<u32> {
        let mut header = self.header(obj)?;
        debug_assert_ne!(header.refcount, u32::MAX, "reference count overflow");
        header.refcount = header.refcount.wrapping_add(1);
        unsafe { obj.write_header(header.encode()) };
        Ok(header.refcount)
    }

    /// Drop a reference, freeing the object and releasing its children when
    /// the count reaches zero
    pub fn release(&mut self, obj: ObjRef) -> RuntimeResult<ReleaseOutcome> {
        self.release_with(obj, |_| {})
    }

    /// Same as [`ArcHeap::release`], reporting every decrement and every
    /// freed block to `observe` as it happens
    ///
    /// A bad child does not stop the walk: the remaining children are still
    /// released and the first error is returned at the end.
    pub fn release_with<F>(&mut self, obj: ObjRef, mut observe: F) -> RuntimeResult<ReleaseOutcome>
    where
        F: FnMut(ReleaseStep),
    {
        let mut outcome = ReleaseOutcome::default();
        let mut first_error = None;
        let mut pending = vec![obj];

        while let Some(obj) = pending.pop() {
            match self.release_one(obj, &mut pending, &mut observe) {
                Ok(Some(bytes)) => {
                    outcome.freed_bytes += bytes;
                    outcome.freed_objects += 1;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("release of {:?} failed: {}", obj, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Decrement one count; returns the freed size when it reached zero
    fn release_one<F>(
        &mut self,
        obj: ObjRef,
        pending: &mut Vec<ObjRef>,
        observe: &mut F,
    ) -> RuntimeResult<Option<usize>>
    where
        F: FnMut(ReleaseStep),
    {
        let size = self.size_of(obj)?;
        let mut header = self.header(obj)?;
        if header.refcount == 0 {
            return Err(RuntimeError::CorruptObject {
                addr: obj.addr(),
                reason: "released with a zero reference count".to_string(),
            });
        }

        header.refcount -= 1;
        unsafe { obj.write_header(header.encode()) };
        observe(ReleaseStep::Dropped {
            obj,
            refcount: header.refcount,
        });
        if header.refcount > 0 {
            return Ok(None);
        }

        let count = header.pointer_count as usize;
        if min_object_len(header.pointer_count) > size {
            return Err(RuntimeError::CorruptObject {
                addr: obj.addr(),
                reason: format!("{} pointer slots do not fit a {} byte block", count, size),
            });
        }
        for index in (0..count).rev() {
            if let Some(child) = unsafe { obj.read_child(index) } {
                pending.push(child);
            }
        }

        let bytes = self.free_raw(obj)?;
        observe(ReleaseStep::Freed { obj, bytes });
        Ok(Some(bytes))
    }

    /// Deallocate a block without looking at its children; returns its size
    pub fn free_raw(&mut self, obj: ObjRef) -> RuntimeResult<usize> {
        let size = self
            .blocks
            .remove(&obj)
            .ok_or(RuntimeError::UnknownObject { addr: obj.addr() })?;

        log::trace!("arc free {:?} ({} bytes)", obj, size);
        unsafe { dealloc(obj.as_ptr(), Layout::from_size_align_unchecked(size, BLOCK_ALIGN)) };

        self.live_bytes -= size;
        self.stats.frees += 1;
        self.stats.freed_bytes += size;
        Ok(size)
    }

    /// Number of live blocks
    pub fn live_objects(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes held by live blocks
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Allocation counters
    pub fn stats(&self) -> &ArcStats {
        &self.stats
    }
}

impl Default for ArcHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ArcHeap {
    /// Report the blocks still live; cycles are never reclaimed and end up here
    pub fn shutdown_report(&self) -> ShutdownReport {
        let report = ShutdownReport {
            live_objects: self.blocks.len(),
            live_bytes: self.live_bytes,
        };
        if report.live_objects > 0 {
            log::warn!(
                "arc heap closed with {} live objects ({} bytes)",
                report.live_objects,
                report.live_bytes
            );
        }
        report
    }
}

impl Drop for ArcHeap {
    fn drop(&mut self) {
        for (obj, size) in self.blocks.drain() {
            unsafe { dealloc(obj.as_ptr(), Layout::from_size_align_unchecked(size, BLOCK_ALIGN)) };
        }
    }
}
