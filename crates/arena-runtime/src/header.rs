//! Object header codec
//!
//! Every heap object, whichever backend owns it, starts with the same 8-byte
//! header. The two backends read the first four bytes differently, so each
//! gets its own typed view over the raw bytes.
//!
//! Layout in memory (little-endian fields):
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ bytes 0-3  │ ARC: reference count                          │
//! │            │ TGC: object length in bytes (or 0xFFFF_FFFF)  │
//! ├────────────┼───────────────────────────────────────────────┤
//! │ bytes 4-5  │ opaque tag, never interpreted by the runtime  │
//! ├────────────┼───────────────────────────────────────────────┤
//! │ bytes 6-7  │ number of embedded pointers                   │
//! ├────────────┴───────────────────────────────────────────────┤
//! │ pointer_count × pointer-sized slots (null or object)       │
//! ├────────────────────────────────────────────────────────────┤
//! │ opaque payload                                             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! A relocated TGC object keeps the sentinel in bytes 0-3 and the byte offset
//! of its copy in bytes 4-7.

use crate::defaults::WORD_SIZE;

/// Size of the header in bytes
pub const HEADER_SIZE: usize = 8;

/// Length value marking a TGC object that has already been copied
pub const FORWARDED_SENTINEL: u32 = u32::MAX;

/// Round `len` up to the next multiple of 8
#[inline]
pub const fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

/// Bytes taken by a header followed by `pointer_count` pointer slots
#[inline]
pub const fn min_object_len(pointer_count: u16) -> usize {
    HEADER_SIZE + pointer_count as usize * WORD_SIZE
}

#[inline]
fn split(bytes: &[u8; HEADER_SIZE]) -> (u32, u16, u16) {
    let first = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let tag = u16::from_le_bytes([bytes[4], bytes[5]]);
    let pointer_count = u16::from_le_bytes([bytes[6], bytes[7]]);
    (first, tag, pointer_count)
}

#[inline]
fn join(first: u32, tag: u16, pointer_count: u16) -> [u8; HEADER_SIZE] {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0..4].copy_from_slice(&first.to_le_bytes());
    bytes[4..6].copy_from_slice(&tag.to_le_bytes());
    bytes[6..8].copy_from_slice(&pointer_count.to_le_bytes());
    bytes
}

/// Header as seen by the reference-counted heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArcHeader {
    /// Number of outstanding references
    pub refcount: u32,
    /// Opaque tag
    pub tag: u16,
    /// Number of embedded owned pointers
    pub pointer_count: u16,
}

impl ArcHeader {
    /// Create a header with the given pointer count and a zero count
    pub fn new(pointer_count: u16) -> Self {
        Self {
            refcount: 0,
            tag: 0,
            pointer_count,
        }
    }

    /// Encode into the fixed byte layout
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        join(self.refcount, self.tag, self.pointer_count)
    }

    /// Decode from the fixed byte layout
    #[inline]
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let (refcount, tag, pointer_count) = split(bytes);
        Self {
            refcount,
            tag,
            pointer_count,
        }
    }
}

/// Header of a live (not yet relocated) object in the copying heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TgcHeader {
    /// Total object length in bytes, header included
    pub length: u32,
    /// Opaque tag
    pub tag: u16,
    /// Number of embedded pointers
    pub pointer_count: u16,
}

impl TgcHeader {
    /// Create a header for an object of `length` bytes
    pub fn new(length: u32, pointer_count: u16) -> Self {
        Self {
            length,
            tag: 0,
            pointer_count,
        }
    }

    /// Length rounded up to the allocation granule
    #[inline]
    pub fn padded_len(&self) -> usize {
        padded_len(self.length as usize)
    }

    /// Encode into the fixed byte layout
    #[inline]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        debug_assert_ne!(self.length, FORWARDED_SENTINEL);
        join(self.length, self.tag, self.pointer_count)
    }
}

/// First word of an object in the copying heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TgcWord {
    /// Object has not been copied during the current collection
    Live(TgcHeader),
    /// Object was copied to `offset` bytes into the copy space
    Forwarded {
        /// Byte offset of the copy from the start of the copy space
        offset: u32,
    },
}

impl TgcWord {
    /// Forwarding record for a copy placed at `offset`
    pub fn forwarded(offset: u32) -> Self {
        TgcWord::Forwarded { offset }
    }

    /// Decode from the fixed byte layout
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let (length, tag, pointer_count) = split(bytes);
        if length == FORWARDED_SENTINEL {
            let offset = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            TgcWord::Forwarded { offset }
        } else {
            TgcWord::Live(TgcHeader {
                length,
                tag,
                pointer_count,
            })
        }
    }

    /// Encode into the fixed byte layout
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        match self {
            TgcWord::Live(header) => header.encode(),
            TgcWord::Forwarded { offset } => {
                let mut bytes = [0u8; HEADER_SIZE];
                bytes[0..4].copy_from_slice(&FORWARDED_SENTINEL.to_le_bytes());
                bytes[4..8].copy_from_slice(&offset.to_le_bytes());
                bytes
            }
        }
    }
}
