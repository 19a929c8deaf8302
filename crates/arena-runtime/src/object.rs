//! Raw object references
//!
//! [`ObjRef`] is the address of an object header in either heap. The raw
//! accessors here do no checking; each heap validates a reference against its
//! own bookkeeping before calling them.

use crate::defaults::WORD_SIZE;
use crate::header::HEADER_SIZE;
use std::fmt;
use std::ptr::{self, NonNull};

/// Address of a heap object header
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonNull<u8>);

impl ObjRef {
    #[inline]
    pub(crate) fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    /// Reinterpret a stack slot or pointer slot word; null yields `None`
    #[inline]
    pub(crate) fn from_word(word: *mut u8) -> Option<Self> {
        NonNull::new(word).map(Self)
    }

    /// Word stored in a stack slot or pointer slot for `obj`
    #[inline]
    pub(crate) fn to_word(obj: Option<Self>) -> *mut u8 {
        obj.map_or(ptr::null_mut(), |o| o.0.as_ptr())
    }

    /// Numeric address of the header
    #[inline]
    pub fn addr(&self) -> usize {
        self.0.as_ptr().addr()
    }

    /// Raw pointer to the header
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// `self` must point to at least `HEADER_SIZE` readable bytes.
    #[inline]
    pub(crate) unsafe fn read_header(self) -> [u8; HEADER_SIZE] {
        ptr::read(self.0.as_ptr() as *const [u8; HEADER_SIZE])
    }

    /// # Safety
    ///
    /// `self` must point to at least `HEADER_SIZE` writable bytes.
    #[inline]
    pub(crate) unsafe fn write_header(self, bytes: [u8; HEADER_SIZE]) {
        ptr::write(self.0.as_ptr() as *mut [u8; HEADER_SIZE], bytes);
    }

    #[inline]
    fn slot(self, index: usize) -> *mut *mut u8 {
        self.0
            .as_ptr()
            .wrapping_add(HEADER_SIZE + index * WORD_SIZE)
            .cast::<*mut u8>()
    }

    /// # Safety
    ///
    /// Slot `index` must lie inside the object and the object must be
    /// word aligned.
    #[inline]
    pub(crate) unsafe fn read_child(self, index: usize) -> Option<ObjRef> {
        ObjRef::from_word(ptr::read(self.slot(index)))
    }

    /// # Safety
    ///
    /// Same as [`ObjRef::read_child`], and the slot must be writable.
    #[inline]
    pub(crate) unsafe fn write_child(self, index: usize, child: Option<ObjRef>) {
        ptr::write(self.slot(index), ObjRef::to_word(child));
    }

    /// # Safety
    ///
    /// `self + start .. self + end` must be readable for `'a`.
    #[inline]
    pub(crate) unsafe fn bytes<'a>(self, start: usize, end: usize) -> &'a [u8] {
        std::slice::from_raw_parts(self.0.as_ptr().add(start), end - start)
    }

    /// # Safety
    ///
    /// `self + start .. self + end` must be writable and unaliased for `'a`.
    #[inline]
    pub(crate) unsafe fn bytes_mut<'a>(self, start: usize, end: usize) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.0.as_ptr().add(start), end - start)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ArcHeader;

    #[repr(C, align(8))]
    struct Block([u8; 32]);

    #[test]
    fn test_header_and_children_roundtrip() {
        let mut block = Block([0; 32]);
        let mut other = Block([0; 32]);
        let obj = ObjRef::new(NonNull::new(block.0.as_mut_ptr()).unwrap());
        let child = ObjRef::new(NonNull::new(other.0.as_mut_ptr()).unwrap());

        unsafe {
            obj.write_header(ArcHeader::new(2).encode());
            obj.write_child(0, Some(child));
            obj.write_child(1, None);

            assert_eq!(ArcHeader::decode(&obj.read_header()).pointer_count, 2);
            assert_eq!(obj.read_child(0), Some(child));
            assert_eq!(obj.read_child(1), None);
        }
    }

    #[test]
    fn test_word_conversion() {
        assert_eq!(ObjRef::from_word(ptr::null_mut()), None);
        assert!(ObjRef::to_word(None).is_null());
    }
}
