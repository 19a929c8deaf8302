//! Runtime context
//!
//! A [`Runtime`] owns one segment chain, one heap backend and one profiler.
//! The backend is chosen at compile time through the type parameter; the
//! profiler is chosen at run time from the configuration.

use crate::arc::{ArcHeap, ReleaseOutcome, ReleaseStep};
use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;
use crate::gc::TgcHeap;
use crate::header::padded_len;
use crate::object::ObjRef;
use crate::profiling::{self, HeapEventKind, Profiler};
use crate::stack::{SegmentChain, StackPtr};

/// What was still allocated when a heap was closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Objects left in the heap
    pub live_objects: usize,

    /// Bytes held by those objects
    pub live_bytes: usize,
}

impl ShutdownReport {
    /// Check whether nothing leaked
    pub fn is_clean(&self) -> bool {
        self.live_objects == 0
    }
}

/// Operations shared by every heap backend
pub trait Heap: Sized {
    /// Build the backend described by `config`
    fn from_config(config: &RuntimeConfig) -> RuntimeResult<Self>;

    /// Bytes currently held by objects
    fn live_bytes(&self) -> usize;

    /// Release what can be released and report what is left
    fn close(&mut self) -> ShutdownReport;
}

impl Heap for ArcHeap {
    fn from_config(_config: &RuntimeConfig) -> RuntimeResult<Self> {
        Ok(ArcHeap::new())
    }

    fn live_bytes(&self) -> usize {
        ArcHeap::live_bytes(self)
    }

    fn close(&mut self) -> ShutdownReport {
        self.shutdown_report()
    }
}

impl Heap for TgcHeap {
    fn from_config(config: &RuntimeConfig) -> RuntimeResult<Self> {
        TgcHeap::new(config.heap.nursery_bits)
    }

    fn live_bytes(&self) -> usize {
        self.used_bytes()
    }

    fn close(&mut self) -> ShutdownReport {
        self.drain()
    }
}

/// Stack, heap and profiler of one program
pub struct Runtime<H: Heap> {
    stack: SegmentChain,
    heap: H,
    profiler: Box<dyn Profiler>,
}

/// Runtime backed by reference counting
pub type ArcRuntime = Runtime<ArcHeap>;

/// Runtime backed by the copying collector
pub type TgcRuntime = Runtime<TgcHeap>;

impl<H: Heap> Runtime<H> {
    /// Create a runtime from a configuration
    ///
    /// Profiling logs are created here when `config.profiling.enabled` is set.
    pub fn new(config: &RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let stack = SegmentChain::new(config.stack.segment_bits)?;
        let heap = H::from_config(config)?;
        let profiler = profiling::from_config(&config.profiling)?;
        log::debug!(
            "runtime created: {} slot segments, profiling {}",
            stack.segment_len(),
            if profiler.is_enabled() { "on" } else { "off" }
        );
        Ok(Self::with_parts(stack, heap, profiler))
    }

    /// Assemble a runtime from existing parts
    pub fn with_parts(stack: SegmentChain, heap: H, profiler: Box<dyn Profiler>) -> Self {
        Self {
            stack,
            heap,
            profiler,
        }
    }

    /// Replace the profiler
    pub fn with_profiler(mut self, profiler: Box<dyn Profiler>) -> Self {
        self.profiler = profiler;
        self
    }

    /// The segment chain
    pub fn stack(&self) -> &SegmentChain {
        &self.stack
    }

    /// The heap backend
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Mutable access to the heap backend
    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// Empty stack pointer
    pub fn base(&self) -> StackPtr {
        self.stack.base()
    }

    /// Push one empty slot
    ///
    /// Reused segments keep whatever was popped off them, so the slot is
    /// cleared before a collection can see it.
    pub fn push(&mut self, sp: StackPtr) -> RuntimeResult<StackPtr> {
        let sp = self.stack.push(sp)?;
        self.stack.write(sp, None)?;
        let stack = &self.stack;
        self.profiler
            .on_stack_push(&|| stack.depth(sp).unwrap_or_default());
        Ok(sp)
    }

    /// Push one slot holding `value`
    pub fn push_value(&mut self, sp: StackPtr, value: Option<ObjRef>) -> RuntimeResult<StackPtr> {
        let sp = self.push(sp)?;
        self.stack.write(sp, value)?;
        Ok(sp)
    }

    /// Pop one slot
    pub fn pop(&self, sp: StackPtr) -> RuntimeResult<StackPtr> {
        self.stack.pop(sp)
    }

    /// Read the slot at `sp`
    pub fn read(&self, sp: StackPtr) -> RuntimeResult<Option<ObjRef>> {
        self.stack.read(sp)
    }

    /// Write the slot at `sp`
    pub fn write(&mut self, sp: StackPtr, value: Option<ObjRef>) -> RuntimeResult<()> {
        self.stack.write(sp, value)
    }

    /// Stack depth at `sp`
    pub fn depth(&self, sp: StackPtr) -> RuntimeResult<usize> {
        self.stack.depth(sp)
    }

    /// Close the heap and the profiler
    ///
    /// Leaks are reported, not treated as errors. A profiling sink failure
    /// is returned after the heap has been closed.
    pub fn shutdown(mut self) -> RuntimeResult<ShutdownReport> {
        let report = self.heap.close();
        log::info!(
            "runtime shut down: {} objects ({} bytes) still live, {} segments",
            report.live_objects,
            report.live_bytes,
            self.stack.segment_count()
        );
        self.profiler.close()?;
        Ok(report)
    }

    fn end_event(&mut self, kind: HeapEventKind, sp: StackPtr) {
        let stack = &self.stack;
        self.profiler
            .heap_event_end(kind, &|| stack.depth(sp).unwrap_or_default());
    }
}

impl Runtime<ArcHeap> {
    /// Runtime with default settings and no profiling
    pub fn arc() -> RuntimeResult<Self> {
        Self::new(&RuntimeConfig::default())
    }

    /// Allocate a zeroed ARC block of `size` bytes
    pub fn allocate(&mut self, size: usize, sp: StackPtr) -> RuntimeResult<ObjRef> {
        self.profiler.heap_event_start();
        let obj = self.heap.allocate(size);
        if obj.is_ok() {
            self.profiler.on_alloc(size);
        }
        self.end_event(HeapEventKind::TypeAlloc, sp);
        obj
    }

    /// Take a reference to `obj`; returns the new count
    pub fn access(&mut self, obj: ObjRef, sp: StackPtr) -> RuntimeResult<u32> {
        self.profiler.heap_event_start();
        let count = self.heap.access(obj);
        self.end_event(HeapEventKind::PtrAccess, sp);
        count
    }

    /// Drop a reference to `obj`
    ///
    /// Every decrement is logged as a `ptr_drop` event and every freed
    /// object as a `type_free` event, children included.
    pub fn release(&mut self, obj: ObjRef, sp: StackPtr) -> RuntimeResult<ReleaseOutcome> {
        let Self {
            stack,
            heap,
            profiler,
        } = self;
        let depth = || stack.depth(sp).unwrap_or_default();

        profiler.heap_event_start();
        heap.release_with(obj, |step| {
            let kind = match step {
                ReleaseStep::Dropped { .. } => HeapEventKind::PtrDrop,
                ReleaseStep::Freed { bytes, .. } => {
                    profiler.on_free(bytes);
                    HeapEventKind::TypeFree
                }
            };
            profiler.heap_event_end(kind, &depth);
            profiler.heap_event_start();
        })
    }
}

impl Runtime<TgcHeap> {
    /// Runtime with default settings and no profiling
    pub fn tgc() -> RuntimeResult<Self> {
        Self::new(&RuntimeConfig::default())
    }

    /// Allocate `size` bytes, collecting with the stack rooted at `sp` when
    /// the active semispace is full
    pub fn allocate(&mut self, size: usize, sp: StackPtr) -> RuntimeResult<ObjRef> {
        self.heap.check_size(size)?;
        if !self.heap.fits(size) {
            self.collect(sp)?;
        }
        self.profiler.heap_event_start();
        let obj = self.heap.bump(size);
        if obj.is_ok() {
            self.profiler.on_alloc(padded_len(size));
        }
        self.end_event(HeapEventKind::TypeAlloc, sp);
        obj
    }

    /// Run a collection rooted at `sp`; returns the bytes freed
    pub fn collect(&mut self, sp: StackPtr) -> RuntimeResult<usize> {
        self.profiler.heap_event_start();
        let freed = self.heap.collect(self.stack.roots(sp)?)?;
        self.profiler.on_free(freed);
        self.end_event(HeapEventKind::Tgc, sp);
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{min_object_len, ArcHeader, TgcHeader};
    use crate::profiling::JsonProfiler;
    use crate::RuntimeError;
    use std::cell::RefCell;
    use std::io::{self, Write};
    use std::rc::Rc;

    fn small_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.stack.segment_bits = 3;
        config.heap.nursery_bits = 8;
        config
    }

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn records(sink: &SharedSink) -> Vec<serde_json::Value> {
        serde_json::from_slice(&sink.0.borrow()).unwrap()
    }

    #[test]
    fn test_push_pop_through_runtime() {
        let mut rt = ArcRuntime::new(&small_config()).unwrap();
        let mut sp = rt.base();
        for _ in 0..20 {
            sp = rt.push(sp).unwrap();
        }
        assert_eq!(rt.depth(sp).unwrap(), 20);
        assert_eq!(rt.stack().segment_count(), 4);

        for _ in 0..20 {
            sp = rt.pop(sp).unwrap();
        }
        assert_eq!(sp, rt.base());
        assert!(matches!(rt.pop(sp), Err(RuntimeError::StackUnderflow)));
    }

    #[test]
    fn test_arc_runtime_release_frees_tree() {
        let mut rt = ArcRuntime::new(&small_config()).unwrap();
        let sp = rt.base();

        let leaf = rt.allocate(min_object_len(0), sp).unwrap();
        rt.access(leaf, sp).unwrap();
        let root = rt.allocate(min_object_len(1), sp).unwrap();
        rt.heap_mut().set_header(root, ArcHeader::new(1)).unwrap();
        rt.access(root, sp).unwrap();
        rt.heap_mut().set_child(root, 0, Some(leaf)).unwrap();

        let outcome = rt.release(root, sp).unwrap();
        assert_eq!(outcome.freed_objects, 2);

        let report = rt.shutdown().unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_tgc_runtime_collects_through_stack() {
        let mut rt = TgcRuntime::new(&small_config()).unwrap();
        let base = rt.base();
        let obj = rt.allocate(32, base).unwrap();
        rt.heap_mut().set_header(obj, TgcHeader::new(32, 1)).unwrap();
        rt.heap_mut().set_child(obj, 0, Some(obj)).unwrap();
        let sp = rt.push_value(base, Some(obj)).unwrap();

        for _ in 0..20 {
            rt.allocate(64, sp).unwrap();
        }
        assert!(rt.heap().stats().collections > 0);

        let moved = rt.read(sp).unwrap().unwrap();
        assert_eq!(rt.heap().child(moved, 0).unwrap(), Some(moved));

        let report = rt.shutdown().unwrap();
        assert_eq!(report, ShutdownReport::default());
    }

    #[test]
    fn test_profiler_sees_runtime_events() {
        let stack_log = SharedSink::default();
        let heap_log = SharedSink::default();
        let profiler = JsonProfiler::new(stack_log.clone(), heap_log.clone(), 1);
        let mut rt = TgcRuntime::new(&small_config())
            .unwrap()
            .with_profiler(Box::new(profiler));

        let sp = rt.push(rt.base()).unwrap();
        let sp = rt.push(sp).unwrap();
        rt.allocate(16, sp).unwrap();
        rt.collect(sp).unwrap();
        rt.shutdown().unwrap();

        let stack = records(&stack_log);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[2]["stack_offset"], 2);

        let heap = records(&heap_log);
        assert_eq!(heap.len(), 2);
        assert_eq!(heap[0]["event"], "type_alloc");
        assert_eq!(heap[0]["currently_allocated_bytes"], 16);
        assert_eq!(heap[1]["event"], "tgc");
        assert_eq!(heap[1]["currently_allocated_bytes"], 0);
    }

    #[test]
    fn test_arc_release_logs_every_drop_and_free() {
        let heap_log = SharedSink::default();
        let profiler = JsonProfiler::new(SharedSink::default(), heap_log.clone(), 1);
        let mut rt = ArcRuntime::new(&small_config())
            .unwrap()
            .with_profiler(Box::new(profiler));
        let sp = rt.base();

        let leaf = rt.allocate(min_object_len(0), sp).unwrap();
        rt.access(leaf, sp).unwrap();
        let root = rt.allocate(min_object_len(1), sp).unwrap();
        rt.heap_mut().set_header(root, ArcHeader::new(1)).unwrap();
        rt.access(root, sp).unwrap();
        rt.heap_mut().set_child(root, 0, Some(leaf)).unwrap();
        rt.release(root, sp).unwrap();
        rt.shutdown().unwrap();

        let kinds: Vec<_> = records(&heap_log)
            .iter()
            .map(|r| r["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            [
                "type_alloc",
                "ptr_access",
                "type_alloc",
                "ptr_access",
                "ptr_drop",
                "type_free",
                "ptr_drop",
                "type_free"
            ]
        );
        let last = records(&heap_log).pop().unwrap();
        assert_eq!(last["currently_allocated_bytes"], 0);
    }

    #[test]
    fn test_dropped_runtime_still_terminates_logs() {
        let stack_log = SharedSink::default();
        let heap_log = SharedSink::default();
        let profiler = JsonProfiler::new(stack_log.clone(), heap_log.clone(), 1);
        let mut rt = TgcRuntime::new(&small_config())
            .unwrap()
            .with_profiler(Box::new(profiler));

        let sp = rt.push(rt.base()).unwrap();
        rt.allocate(16, sp).unwrap();
        drop(rt);

        assert_eq!(records(&stack_log).len(), 2);
        assert_eq!(records(&heap_log).len(), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.stack.segment_bits = 1;
        assert!(matches!(
            ArcRuntime::new(&config),
            Err(RuntimeError::Config(_))
        ));
    }
}
