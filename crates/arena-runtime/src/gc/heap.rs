//! Copying nursery heap
//!
//! Allocation bumps a cursor through the active semispace. When a request
//! does not fit, the heap runs a stop-the-world collection rooted at the
//! segment chain, swaps the semispaces and retries once.
//!
//! Every [`ObjRef`] into this heap is invalidated by a collection. The only
//! references the collector updates are the ones stored on the stack, so an
//! object must be reachable from a stack slot before the next allocation.

use super::collector::{validate, Collector, GcStats};
use super::semispace::Semispace;
use crate::defaults::{MAX_NURSERY_BITS, MIN_NURSERY_BITS};
use crate::error::{RuntimeError, RuntimeResult};
use crate::header::{min_object_len, padded_len, TgcHeader, TgcWord, HEADER_SIZE};
use crate::object::ObjRef;
use crate::runtime::ShutdownReport;
use crate::stack::{RootSlot, SegmentChain, StackPtr};
use std::time::Instant;

/// Two-semispace copying heap
pub struct TgcHeap {
    /// Receives new allocations
    active: Semispace,

    /// Receives survivors during a collection
    copy: Semispace,

    /// Statistics
    stats: GcStats,

    /// Set when a collection failed part-way
    poisoned: bool,
}

impl TgcHeap {
    /// Create a heap whose semispaces hold `2^nursery_bits` bytes each
    pub fn new(nursery_bits: u32) -> RuntimeResult<Self> {
        if !(MIN_NURSERY_BITS..=MAX_NURSERY_BITS).contains(&nursery_bits) {
            return Err(RuntimeError::Config(format!(
                "nursery bits must be in {}..={}, got {}",
                MIN_NURSERY_BITS, MAX_NURSERY_BITS, nursery_bits
            )));
        }
        let capacity = 1usize << nursery_bits;
        Ok(Self {
            active: Semispace::with_capacity(capacity)?,
            copy: Semispace::with_capacity(capacity)?,
            stats: GcStats::default(),
            poisoned: false,
        })
    }

    /// Bytes per semispace
    pub fn capacity(&self) -> usize {
        self.active.capacity()
    }

    /// Bytes allocated in the active semispace
    pub fn used_bytes(&self) -> usize {
        self.active.used_bytes()
    }

    /// Collection statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Whether a failed collection left the heap unusable
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn usable(&self) -> RuntimeResult<()> {
        if self.poisoned {
            return Err(RuntimeError::HeapPoisoned);
        }
        Ok(())
    }

    /// Validate a request size; returns it padded to the allocation granule
    pub fn check_size(&self, size: usize) -> RuntimeResult<usize> {
        if size < HEADER_SIZE || size >= u32::MAX as usize {
            return Err(RuntimeError::InvalidSize { size });
        }
        Ok(padded_len(size))
    }

    /// Check whether a `size`-byte request fits without collecting
    pub fn fits(&self, size: usize) -> bool {
        self.check_size(size).map_or(false, |padded| self.active.fits(padded))
    }

    /// Allocate `size` bytes, collecting first if the active space is full
    ///
    /// The block is zeroed and its header holds `length = size` and no
    /// pointers. Fails with [`RuntimeError::HeapExhausted`] when the request
    /// does not fit even after collecting.
    pub fn allocate(
        &mut self,
        size: usize,
        stack: &mut SegmentChain,
        sp: StackPtr,
    ) -> RuntimeResult<ObjRef> {
        self.check_size(size)?;
        if !self.fits(size) {
            self.collect(stack.roots(sp)?)?;
        }
        self.bump(size)
    }

    /// Bump-allocate without collecting
    pub(crate) fn bump(&mut self, size: usize) -> RuntimeResult<ObjRef> {
        self.usable()?;
        let padded = self.check_size(size)?;
        let ptr = self.active.bump(padded).ok_or(RuntimeError::HeapExhausted {
            requested: padded,
            live: self.active.used_bytes(),
            capacity: self.active.capacity(),
        })?;

        let obj = ObjRef::new(ptr);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, padded);
            obj.write_header(TgcHeader::new(size as u32, 0).encode());
        }
        Ok(obj)
    }

    /// Collect with the stack rooted at `sp`
    pub fn collect_stack(&mut self, stack: &mut SegmentChain, sp: StackPtr) -> RuntimeResult<usize> {
        self.collect(stack.roots(sp)?)
    }

    /// Evacuate everything reachable from `roots` and swap semispaces;
    /// returns the bytes freed
    ///
    /// Root slots are rewritten to the new addresses. On error the heap is
    /// left partially evacuated and every later operation fails with
    /// [`RuntimeError::HeapPoisoned`].
    pub fn collect<'r>(
        &mut self,
        roots: impl IntoIterator<Item = RootSlot<'r>>,
    ) -> RuntimeResult<usize> {
        self.usable()?;
        let start = Instant::now();
        let before = self.active.used_bytes();

        self.copy.reset();
        if let Err(err) = self.evacuate(roots) {
            log::error!("collection failed, nursery is unusable: {}", err);
            self.poisoned = true;
            return Err(err);
        }
        std::mem::swap(&mut self.active, &mut self.copy);
        self.copy.reset();

        let live = self.active.used_bytes();
        let freed = before - live;
        self.stats.update(start.elapsed(), freed, live);

        log::debug!(
            "collection #{}: {} bytes live, {} bytes freed",
            self.stats.collections,
            live,
            freed
        );
        Ok(freed)
    }

    fn evacuate<'r>(&mut self, roots: impl IntoIterator<Item = RootSlot<'r>>) -> RuntimeResult<()> {
        let mut collector = Collector::new(&self.active, &mut self.copy);
        for mut slot in roots {
            if let Some(obj) = slot.get() {
                slot.set(Some(collector.relocate(obj)?));
            }
        }
        collector.scan()
    }

    fn live_header(&self, obj: ObjRef) -> RuntimeResult<TgcHeader> {
        self.usable()?;
        let offset = match self.active.offset_of(obj.addr()) {
            Some(offset) if offset % HEADER_SIZE == 0 => offset,
            _ => return Err(RuntimeError::ForeignPointer { addr: obj.addr() }),
        };
        match TgcWord::decode(&unsafe { obj.read_header() }) {
            TgcWord::Live(header) => {
                let len = validate(obj, &header)?;
                // a stale reference may land inside another object's payload
                if offset + len > self.active.used_bytes() {
                    return Err(RuntimeError::CorruptObject {
                        addr: obj.addr(),
                        reason: format!("length {} runs past the allocated space", header.length),
                    });
                }
                Ok(header)
            }
            TgcWord::Forwarded { .. } => Err(RuntimeError::CorruptObject {
                addr: obj.addr(),
                reason: "object was relocated".to_string(),
            }),
        }
    }

    /// Check whether `obj` is the address of an object in the active space
    pub fn contains(&self, obj: ObjRef) -> bool {
        self.live_header(obj).is_ok()
    }

    /// Read the header of an object
    pub fn header(&self, obj: ObjRef) -> RuntimeResult<TgcHeader> {
        self.live_header(obj)
    }

    /// Overwrite the header of an object
    ///
    /// The padded length must stay that of the allocation and the pointer
    /// slots must fit the new length.
    pub fn set_header(&mut self, obj: ObjRef, header: TgcHeader) -> RuntimeResult<()> {
        let current = self.live_header(obj)?;
        let len = validate(obj, &header)?;
        if len != current.padded_len() {
            return Err(RuntimeError::CorruptObject {
                addr: obj.addr(),
                reason: format!(
                    "length {} does not match the {} byte allocation",
                    header.length,
                    current.padded_len()
                ),
            });
        }
        unsafe { obj.write_header(header.encode()) };
        Ok(())
    }

    fn checked_slot(&self, obj: ObjRef, index: usize) -> RuntimeResult<()> {
        let count = self.live_header(obj)?.pointer_count as usize;
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
    pub fn set_child(
        &mut self,
        obj: ObjRef,
        index: usize,
        child: Option<ObjRef>,
    ) -> RuntimeResult<()> {
        self.checked_slot(obj, index)?;
        if let Some(child) = child {
            self.live_header(child)?;
        }
        unsafe { obj.write_child(index, child) };
        Ok(())
    }

    /// Bytes after the pointer slots, up to the object length
    pub fn payload(&self, obj: ObjRef) -> RuntimeResult<&[u8]> {
        let header = self.live_header(obj)?;
        let start = min_object_len(header.pointer_count);
        Ok(unsafe { obj.bytes(start, header.length as usize) })
    }

    /// Mutable bytes after the pointer slots, up to the object length
    pub fn payload_mut(&mut self, obj: ObjRef) -> RuntimeResult<&mut [u8]> {
        let header = self.live_header(obj)?;
        let start = min_object_len(header.pointer_count);
        Ok(unsafe { obj.bytes_mut(start, header.length as usize) })
    }

    /// Objects in the active space, in allocation (or copy) order
    pub fn objects(&self) -> Objects<'_> {
        Objects {
            space: &self.active,
            offset: 0,
        }
    }
}

impl TgcHeap {
    /// Collect with an empty root set and report what survived
    pub fn drain(&mut self) -> ShutdownReport {
        if let Err(err) = self.collect(std::iter::empty()) {
            log::warn!("final collection failed: {}", err);
        }
        let report = ShutdownReport {
            live_objects: self.objects().count(),
            live_bytes: self.active.used_bytes(),
        };
        if !self.active.is_empty() {
            log::warn!("nursery is not empty after the final collection ({} bytes)", report.live_bytes);
        }
        report
    }
}

/// Walk over the objects of the active semispace
pub struct Objects<'a> {
    space: &'a Semispace,
    offset: usize,
}

impl Objects<'_> {
    fn fits_space(&self, obj: ObjRef, header: &TgcHeader) -> bool {
        validate(obj, header).map_or(false, |len| self.offset + len <= self.space.used_bytes())
    }
}

impl Iterator for Objects<'_> {
    type Item = ObjRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.space.used_bytes() {
            return None;
        }
        let obj = ObjRef::new(self.space.at(self.offset));
        match TgcWord::decode(&unsafe { obj.read_header() }) {
            TgcWord::Live(header) if self.fits_space(obj, &header) => {
                self.offset += header.padded_len();
                Some(obj)
            }
            _ => {
                self.offset = self.space.used_bytes();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(nursery_bits: u32) -> (TgcHeap, SegmentChain) {
        (TgcHeap::new(nursery_bits).unwrap(), SegmentChain::new(3).unwrap())
    }

    #[test]
    fn test_allocate_prefills_header() {
        let (mut heap, mut stack) = setup(8);
        let sp = stack.base();
        let obj = heap.allocate(13, &mut stack, sp).unwrap();

        assert_eq!(heap.header(obj).unwrap(), TgcHeader::new(13, 0));
        assert_eq!(heap.used_bytes(), 16);
        assert_eq!(heap.payload(obj).unwrap().len(), 5);
        assert_eq!(heap.stats().collections, 0);
    }

    #[test]
    fn test_allocate_invalid_sizes() {
        let (mut heap, mut stack) = setup(8);
        let sp = stack.base();
        assert!(matches!(
            heap.allocate(7, &mut stack, sp),
            Err(RuntimeError::InvalidSize { size: 7 })
        ));
        assert!(matches!(
            heap.allocate(512, &mut stack, sp),
            Err(RuntimeError::HeapExhausted { .. })
        ));
    }

    #[test]
    fn test_unrooted_objects_are_reclaimed_on_exhaustion() {
        let (mut heap, mut stack) = setup(6);
        let sp = stack.base();
        for _ in 0..4 {
            heap.allocate(16, &mut stack, sp).unwrap();
        }
        assert_eq!(heap.used_bytes(), 64);

        heap.allocate(16, &mut stack, sp).unwrap();
        assert_eq!(heap.stats().collections, 1);
        assert_eq!(heap.stats().last_freed_bytes, 64);
        assert_eq!(heap.used_bytes(), 16);
    }

    #[test]
    fn test_rooted_objects_survive_and_roots_are_updated() {
        let (mut heap, mut stack) = setup(8);
        let base = stack.base();
        let obj = heap.allocate(24, &mut stack, base).unwrap();
        heap.payload_mut(obj).unwrap().copy_from_slice(b"survivor-payload");
        let sp = stack.push_value(stack.base(), Some(obj)).unwrap();

        let freed = heap.collect_stack(&mut stack, sp).unwrap();
        assert_eq!(freed, 0);

        let moved = stack.read(sp).unwrap().unwrap();
        assert_ne!(moved, obj);
        assert_eq!(heap.payload(moved).unwrap(), b"survivor-payload");
        assert!(!heap.contains(obj));
    }

    #[test]
    fn test_exhausted_after_collection() {
        let (mut heap, mut stack) = setup(5);
        let mut sp = stack.base();
        for _ in 0..2 {
            let obj = heap.allocate(16, &mut stack, sp).unwrap();
            sp = stack.push_value(sp, Some(obj)).unwrap();
        }

        let err = heap.allocate(8, &mut stack, sp).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::HeapExhausted {
                requested: 8,
                live: 32,
                capacity: 32
            }
        ));
    }

    #[test]
    fn test_set_header_keeps_allocation_size() {
        let (mut heap, mut stack) = setup(8);
        let sp = stack.base();
        let obj = heap.allocate(24, &mut stack, sp).unwrap();

        assert!(heap.set_header(obj, TgcHeader::new(24, 2)).is_ok());
        assert!(heap.set_header(obj, TgcHeader::new(48, 2)).is_err());
        assert!(heap.set_header(obj, TgcHeader::new(24, 3)).is_err());
    }

    #[test]
    fn test_set_child_rejects_foreign_object() {
        let (mut heap, mut stack) = setup(8);
        let (mut other, mut other_stack) = setup(8);
        let sp = stack.base();
        let other_sp = other_stack.base();
        let obj = heap.allocate(16, &mut stack, sp).unwrap();
        heap.set_header(obj, TgcHeader::new(16, 1)).unwrap();
        let foreign = other.allocate(8, &mut other_stack, other_sp).unwrap();

        assert!(matches!(
            heap.set_child(obj, 0, Some(foreign)),
            Err(RuntimeError::ForeignPointer { .. })
        ));
        assert!(heap.set_child(obj, 0, Some(obj)).is_ok());
    }

    #[test]
    fn test_close_drains_everything() {
        let (mut heap, mut stack) = setup(8);
        let base = stack.base();
        let obj = heap.allocate(32, &mut stack, base).unwrap();
        stack.push_value(stack.base(), Some(obj)).unwrap();

        let report = heap.drain();
        assert_eq!(report, ShutdownReport::default());
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn test_objects_walk() {
        let (mut heap, mut stack) = setup(8);
        let sp = stack.base();
        let a = heap.allocate(8, &mut stack, sp).unwrap();
        let b = heap.allocate(20, &mut stack, sp).unwrap();

        assert_eq!(heap.objects().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn test_header_past_the_cursor_is_rejected() {
        let (mut heap, mut stack) = setup(8);
        let sp = stack.base();
        let obj = heap.allocate(16, &mut stack, sp).unwrap();
        unsafe { obj.write_header(TgcHeader::new(200, 0).encode()) };

        assert!(matches!(heap.payload(obj), Err(RuntimeError::CorruptObject { .. })));
        assert!(!heap.contains(obj));
        assert_eq!(heap.objects().count(), 0);
    }

    #[test]
    fn test_failed_collection_poisons_the_heap() {
        let (mut heap, mut stack) = setup(8);
        let (mut other, mut other_stack) = setup(8);
        let base = stack.base();
        let other_base = other_stack.base();
        let obj = heap.allocate(16, &mut stack, base).unwrap();
        let foreign = other.allocate(16, &mut other_stack, other_base).unwrap();
        let sp = stack.push_value(base, Some(obj)).unwrap();
        let sp = stack.push_value(sp, Some(foreign)).unwrap();

        assert!(matches!(
            heap.collect_stack(&mut stack, sp),
            Err(RuntimeError::ForeignPointer { .. })
        ));
        assert!(heap.is_poisoned());
        assert!(matches!(
            heap.allocate(16, &mut stack, base),
            Err(RuntimeError::HeapPoisoned)
        ));
        assert!(matches!(
            heap.collect_stack(&mut stack, base),
            Err(RuntimeError::HeapPoisoned)
        ));
        assert!(matches!(heap.header(obj), Err(RuntimeError::HeapPoisoned)));
    }

    #[test]
    fn test_fits_rejects_oversized_requests() {
        let (heap, _) = setup(8);
        assert!(heap.fits(256));
        assert!(!heap.fits(usize::MAX));
        assert!(matches!(
            heap.check_size(usize::MAX),
            Err(RuntimeError::InvalidSize { .. })
        ));
    }
}
