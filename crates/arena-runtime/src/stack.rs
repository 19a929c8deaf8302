//! Segmented value stack
//!
//! The stack is a chain of fixed-size segments. Each segment is aligned to its
//! own size, so the segment base of any stack pointer is found by masking the
//! low address bits.
//!
//! # Segment Layout
//!
//! ```text
//!  segment k                              segment k+1
//! ┌───────────────────────────┐          ┌───────────────────────────┐
//! │ slot 0    back-link ──────┼─┐   ┌───►│ slot 0    back-link ──────┼─┐
//! │ slot 1    value           │ │   │    │ slot 1    value      ◄────┼─┼─┐
//! │ ...                       │ │   │    │ ...                       │ │ │
//! │ slot N-2  value      ◄────┼─┼───┼────┼───────────────────────────┘ │ │
//! │ slot N-1  forward-link ───┼─┼───┘    │ slot N-1  forward-link      │ │
//! └───────────────────────────┘ │        └─────────────────────────────┘ │
//!                               ▼                                        │
//!                       previous segment   forward-link targets slot 1 ──┘
//! ```
//!
//! Links store exact stack pointers: the back-link is the stack pointer to
//! resume at in the previous segment, the forward-link is slot 1 of the next
//! segment. Segments are allocated lazily on first overflow and then reused by
//! every later growth; none is released before the chain itself is dropped.
//!
//! A stack pointer addresses the most recently pushed slot. The empty stack is
//! slot 0 of the bottom segment.

use crate::defaults::{MAX_SEGMENT_BITS, MIN_SEGMENT_BITS, WORD_SIZE};
use crate::error::{RuntimeError, RuntimeResult};
use crate::object::ObjRef;
use rustc_hash::FxHashSet;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

/// Address of a stack slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackPtr(NonNull<*mut u8>);

impl StackPtr {
    #[inline]
    fn from_word(word: *mut u8) -> Option<Self> {
        NonNull::new(word.cast::<*mut u8>()).map(Self)
    }

    #[inline]
    fn as_word(self) -> *mut u8 {
        self.0.as_ptr().cast::<u8>()
    }

    /// Numeric address of the slot
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.as_ptr().addr()
    }
}

impl std::fmt::Debug for StackPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StackPtr({:#x})", self.addr())
    }
}

/// Chain of self-aligned stack segments
pub struct SegmentChain {
    /// Slots per segment is `1 << segment_bits`
    segment_bits: u32,

    /// Every segment ever allocated, in allocation order
    segments: Vec<NonNull<*mut u8>>,

    /// Segment base addresses, for validating incoming stack pointers
    bases: FxHashSet<usize>,
}

impl SegmentChain {
    /// Allocate the bottom segment
    pub fn new(segment_bits: u32) -> RuntimeResult<Self> {
        if !(MIN_SEGMENT_BITS..=MAX_SEGMENT_BITS).contains(&segment_bits) {
            return Err(RuntimeError::Config(format!(
                "segment bits must be in {}..={}, got {}",
                MIN_SEGMENT_BITS, MAX_SEGMENT_BITS, segment_bits
            )));
        }

        let mut chain = Self {
            segment_bits,
            segments: Vec::new(),
            bases: FxHashSet::default(),
        };
        chain.alloc_segment(ptr::null_mut())?;
        Ok(chain)
    }

    /// Slots per segment, both links included
    #[inline]
    pub fn segment_len(&self) -> usize {
        1 << self.segment_bits
    }

    /// Value slots per segment
    #[inline]
    pub fn usable_slots(&self) -> usize {
        self.segment_len() - 2
    }

    /// Number of segments allocated so far
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Stack pointer of the empty stack (slot 0 of the bottom segment)
    pub fn base(&self) -> StackPtr {
        StackPtr(self.segments[0])
    }

    #[inline]
    fn segment_bytes(&self) -> usize {
        self.segment_len() * WORD_SIZE
    }

    fn layout(&self) -> RuntimeResult<Layout> {
        let bytes = self.segment_bytes();
        Layout::from_size_align(bytes, bytes)
            .map_err(|_| RuntimeError::OutOfMemory { bytes })
    }

    /// Allocate a zeroed segment whose slot 0 holds `back_link`
    fn alloc_segment(&mut self, back_link: *mut u8) -> RuntimeResult<NonNull<*mut u8>> {
        let layout = self.layout()?;
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw.cast::<*mut u8>()).ok_or(RuntimeError::OutOfMemory {
            bytes: layout.size(),
        })?;

        unsafe {
            base.as_ptr().write(back_link);
        }
        self.segments.push(base);
        self.bases.insert(base.as_ptr().addr());

        log::debug!(
            "allocated stack segment #{} at {:#x} ({} slots)",
            self.segments.len(),
            base.as_ptr().addr(),
            self.segment_len()
        );
        Ok(base)
    }

    #[inline]
    fn slot_index(&self, sp: StackPtr) -> usize {
        (sp.addr() & (self.segment_bytes() - 1)) / WORD_SIZE
    }

    #[inline]
    fn segment_base(&self, sp: StackPtr) -> *mut *mut u8 {
        let offset = sp.addr() & (self.segment_bytes() - 1);
        sp.0.as_ptr().wrapping_byte_sub(offset)
    }

    /// Reject stack pointers that do not address a value slot or link of
    /// one of our segments
    fn check(&self, sp: StackPtr) -> RuntimeResult<()> {
        let base = self.segment_base(sp).addr();
        let aligned = sp.addr() % WORD_SIZE == 0;
        if !aligned || !self.bases.contains(&base) || self.slot_index(sp) == self.segment_len() - 1 {
            return Err(RuntimeError::ForeignStackPointer { addr: sp.addr() });
        }
        Ok(())
    }

    /// Advance to the next slot, crossing into the next segment when `sp`
    /// is the last value slot of its segment
    pub fn push(&mut self, sp: StackPtr) -> RuntimeResult<StackPtr> {
        self.check(sp)?;

        if self.slot_index(sp) != self.segment_len() - 2 {
            return Ok(StackPtr(unsafe { sp.0.add(1) }));
        }

        // SAFETY: sp is the last value slot, so sp + 1 is this segment's
        // forward-link slot.
        let forward = unsafe { sp.0.as_ptr().add(1) };
        if let Some(next) = StackPtr::from_word(unsafe { forward.read() }) {
            return Ok(next);
        }

        let segment = self.alloc_segment(sp.as_word())?;
        let first = StackPtr(unsafe { segment.add(1) });
        unsafe {
            forward.write(first.as_word());
        }
        Ok(first)
    }

    /// Step back to the previously pushed slot, following the back-link when
    /// leaving a segment
    pub fn pop(&self, sp: StackPtr) -> RuntimeResult<StackPtr> {
        self.check(sp)?;

        match self.slot_index(sp) {
            0 => Err(RuntimeError::StackUnderflow),
            1 => {
                let base = self.segment_base(sp);
                match StackPtr::from_word(unsafe { base.read() }) {
                    Some(back) => Ok(back),
                    None => Ok(StackPtr(unsafe { NonNull::new_unchecked(base) })),
                }
            }
            _ => Ok(StackPtr(unsafe { sp.0.sub(1) })),
        }
    }

    /// Read the value slot at `sp`
    pub fn read(&self, sp: StackPtr) -> RuntimeResult<Option<ObjRef>> {
        self.check(sp)?;
        if self.slot_index(sp) == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(ObjRef::from_word(unsafe { sp.0.as_ptr().read() }))
    }

    /// Write the value slot at `sp`
    pub fn write(&mut self, sp: StackPtr, value: Option<ObjRef>) -> RuntimeResult<()> {
        self.check(sp)?;
        if self.slot_index(sp) == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        unsafe {
            sp.0.as_ptr().write(ObjRef::to_word(value));
        }
        Ok(())
    }

    /// Push `value` and return the new stack pointer
    pub fn push_value(&mut self, sp: StackPtr, value: Option<ObjRef>) -> RuntimeResult<StackPtr> {
        let sp = self.push(sp)?;
        self.write(sp, value)?;
        Ok(sp)
    }

    /// Number of occupied value slots from the bottom of the stack up to `sp`
    pub fn depth(&self, sp: StackPtr) -> RuntimeResult<usize> {
        self.check(sp)?;

        let mut below = 0;
        let mut base = self.segment_base(sp);
        while let Some(back) = StackPtr::from_word(unsafe { base.read() }) {
            below += 1;
            base = self.segment_base(back);
        }
        Ok(self.slot_index(sp) + below * self.usable_slots())
    }

    /// Every occupied value slot from `sp` down to the bottom of the stack
    pub fn roots(&mut self, sp: StackPtr) -> RuntimeResult<Roots<'_>> {
        self.check(sp)?;
        Ok(Roots {
            cursor: sp.0.as_ptr(),
            mask: self.segment_bytes() - 1,
            _chain: PhantomData,
        })
    }
}

impl Drop for SegmentChain {
    fn drop(&mut self) {
        if let Ok(layout) = self.layout() {
            for segment in self.segments.drain(..) {
                unsafe { dealloc(segment.as_ptr().cast::<u8>(), layout) };
            }
        }
    }
}

/// Root set walk over a segment chain, top of stack first
pub struct Roots<'a> {
    cursor: *mut *mut u8,
    mask: usize,
    _chain: PhantomData<&'a mut SegmentChain>,
}

impl<'a> Iterator for Roots<'a> {
    type Item = RootSlot<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cursor.is_null() {
                return None;
            }
            if self.cursor.addr() & self.mask == 0 {
                // slot 0: resume in the previous segment, or stop at the bottom
                self.cursor = unsafe { self.cursor.read() }.cast::<*mut u8>();
                continue;
            }
            let slot = self.cursor;
            self.cursor = self.cursor.wrapping_sub(1);
            return Some(RootSlot {
                slot,
                _chain: PhantomData,
            });
        }
    }
}

/// One value slot visited by [`Roots`]
pub struct RootSlot<'a> {
    slot: *mut *mut u8,
    _chain: PhantomData<&'a mut SegmentChain>,
}

impl RootSlot<'_> {
    /// Address of the slot
    pub fn addr(&self) -> usize {
        self.slot.addr()
    }

    /// Current slot content
    #[inline]
    pub fn get(&self) -> Option<ObjRef> {
        ObjRef::from_word(unsafe { self.slot.read() })
    }

    /// Overwrite the slot content
    #[inline]
    pub fn set(&mut self, value: Option<ObjRef>) {
        unsafe { self.slot.write(ObjRef::to_word(value)) }
    }
}
