//! Copying collector
//!
//! Live objects are evacuated from the active semispace into the copy
//! semispace with Cheney's algorithm: roots are relocated first, then the copy
//! space is scanned front to back, relocating every child of every copied
//! object. The unscanned tail of the copy space is the worklist, so the
//! traversal needs no recursion and no auxiliary queue.
//!
//! Relocating an object leaves a forwarding record in its old header before
//! any of its children are visited. A second visit, through a shared
//! reference or a cycle, finds the record and reuses the copy.

use super::semispace::Semispace;
use crate::error::{RuntimeError, RuntimeResult};
use crate::header::{min_object_len, padded_len, TgcHeader, TgcWord, HEADER_SIZE};
use crate::object::ObjRef;
use std::ptr;
use std::time::Duration;

/// Garbage collector statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Total bytes copied into the copy space
    pub bytes_copied: usize,

    /// Bytes freed in the last collection
    pub last_freed_bytes: usize,

    /// Live bytes after the last collection
    pub live_bytes: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Maximum pause time
    pub max_pause_time: Duration,
}

impl GcStats {
    /// Update statistics after a collection
    pub(crate) fn update(&mut self, pause_time: Duration, freed: usize, live: usize) {
        self.collections += 1;
        self.bytes_freed += freed;
        self.bytes_copied += live;
        self.last_freed_bytes = freed;
        self.live_bytes = live;
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;
        if pause_time > self.max_pause_time {
            self.max_pause_time = pause_time;
        }
    }

    /// Average pause time
    pub fn avg_pause_time(&self) -> Duration {
        if self.collections == 0 {
            return Duration::ZERO;
        }
        self.total_pause_time / self.collections as u32
    }
}

/// One evacuation from `from` into `to`
pub(crate) struct Collector<'a> {
    from: &'a Semispace,
    to: &'a mut Semispace,
}

impl<'a> Collector<'a> {
    pub(crate) fn new(from: &'a Semispace, to: &'a mut Semispace) -> Self {
        Self { from, to }
    }

    /// Copy `obj` unless it was copied already; returns the copy
    pub(crate) fn relocate(&mut self, obj: ObjRef) -> RuntimeResult<ObjRef> {
        let offset = match self.from.offset_of(obj.addr()) {
            Some(offset) if offset % HEADER_SIZE == 0 => offset,
            _ => return Err(RuntimeError::ForeignPointer { addr: obj.addr() }),
        };

        let header = match TgcWord::decode(&unsafe { obj.read_header() }) {
            TgcWord::Forwarded { offset } => {
                let offset = offset as usize;
                if offset >= self.to.used_bytes() {
                    return Err(corrupt(obj, format!("forwarding offset {} out of range", offset)));
                }
                return Ok(ObjRef::new(self.to.at(offset)));
            }
            TgcWord::Live(header) => header,
        };

        let len = validate(obj, &header)?;
        if offset + len > self.from.used_bytes() {
            return Err(corrupt(obj, format!("length {} runs past the allocated space", len)));
        }
        let dest = self
            .to
            .bump(len)
            .ok_or_else(|| corrupt(obj, "copy space overflow".to_string()))?;

        let new_offset = dest.as_ptr().addr() - self.to.base_addr();
        unsafe {
            ptr::copy_nonoverlapping(obj.as_ptr(), dest.as_ptr(), len);
            obj.write_header(TgcWord::forwarded(new_offset as u32).encode());
        }
        Ok(ObjRef::new(dest))
    }

    /// Relocate the children of every copied object until the scan pointer
    /// catches up with the copy cursor
    pub(crate) fn scan(&mut self) -> RuntimeResult<()> {
        let mut scan = 0;
        while scan < self.to.used_bytes() {
            let obj = ObjRef::new(self.to.at(scan));
            let header = match TgcWord::decode(&unsafe { obj.read_header() }) {
                TgcWord::Live(header) => header,
                TgcWord::Forwarded { .. } => {
                    return Err(corrupt(obj, "forwarding record in copy space".to_string()));
                }
            };

            for index in 0..header.pointer_count as usize {
                if let Some(child) = unsafe { obj.read_child(index) } {
                    let moved = self.relocate(child)?;
                    unsafe { obj.write_child(index, Some(moved)) };
                }
            }
            scan += header.padded_len();
        }
        Ok(())
    }
}

/// Check a live header against the layout contract; returns the padded length
pub(crate) fn validate(obj: ObjRef, header: &TgcHeader) -> RuntimeResult<usize> {
    let len = header.length as usize;
    if len < HEADER_SIZE {
        return Err(corrupt(obj, format!("length {} is shorter than a header", len)));
    }
    if min_object_len(header.pointer_count) > len {
        return Err(corrupt(
            obj,
            format!("{} pointer slots do not fit {} bytes", header.pointer_count, len),
        ));
    }
    Ok(padded_len(len))
}

fn corrupt(obj: ObjRef, reason: String) -> RuntimeError {
    RuntimeError::CorruptObject {
        addr: obj.addr(),
        reason,
    }
}
