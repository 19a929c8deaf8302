//! Bump-allocated semispace
//!
//! A semispace is one contiguous, 8-byte aligned block with a cursor marking
//! the next free byte. Allocation just advances the cursor; memory is only
//! ever reclaimed wholesale by [`Semispace::reset`].

use crate::error::{RuntimeError, RuntimeResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

const SPACE_ALIGN: usize = 8;

/// One half of the copying heap
pub struct Semispace {
    /// Start of the block
    base: NonNull<u8>,

    /// Bytes in the block
    capacity: usize,

    /// Offset of the next free byte
    cursor: usize,
}

impl Semispace {
    /// Allocate a zeroed semispace of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> RuntimeResult<Self> {
        let layout = Layout::from_size_align(capacity, SPACE_ALIGN)
            .map_err(|_| RuntimeError::InvalidSize { size: capacity })?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(RuntimeError::OutOfMemory { bytes: capacity })?;
        Ok(Self {
            base,
            capacity,
            cursor: 0,
        })
    }

    /// Check whether `len` more bytes fit
    #[inline]
    pub fn fits(&self, len: usize) -> bool {
        len <= self.remaining_bytes()
    }

    /// Reserve `len` bytes; `None` if the space is full
    pub fn bump(&mut self, len: usize) -> Option<NonNull<u8>> {
        if !self.fits(len) {
            return None;
        }
        let ptr = self.at(self.cursor);
        self.cursor += len;
        Some(ptr)
    }

    /// Discard everything allocated so far
    #[inline]
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Pointer `offset` bytes into the block
    #[inline]
    pub fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity);
        unsafe { self.base.add(offset) }
    }

    /// Offset of `addr` from the start of the block, if it lies in the
    /// allocated prefix
    #[inline]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base.as_ptr().addr())?;
        (offset < self.cursor).then_some(offset)
    }

    /// Start address of the block
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr().addr()
    }

    /// Bytes allocated so far
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.cursor
    }

    /// Total bytes in the block
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes still free
    #[inline]
    pub fn remaining_bytes(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Check whether nothing is allocated
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }
}

impl Drop for Semispace {
    fn drop(&mut self) {
        unsafe {
            dealloc(
                self.base.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, SPACE_ALIGN),
            );
        }
    }
}
