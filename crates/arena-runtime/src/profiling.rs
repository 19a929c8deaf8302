//! Instrumentation hooks
//!
//! The runtime calls a [`Profiler`] at fixed hook points: every stack push,
//! around every heap operation, and for every allocated or freed byte. The
//! default [`NoopProfiler`] ignores all of them. [`JsonProfiler`] writes two
//! JSON arrays, one with stack samples and one with heap events, sampling
//! every `frequency`-th event.
//!
//! Sink failures never reach the runtime. The first one is kept and returned
//! by [`Profiler::close`].

use crate::config::ProfilingConfig;
use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::{Duration, Instant};

/// Lazily computed stack depth, evaluated only for sampled events
pub type DepthFn<'a> = &'a dyn Fn() -> usize;

/// Kind of heap operation being timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapEventKind {
    /// Allocation of an object
    TypeAlloc,
    /// An object was freed
    TypeFree,
    /// Reference count increment
    PtrAccess,
    /// Reference count decrement
    PtrDrop,
    /// Copying collection
    Tgc,
}

/// Hook points invoked by the runtime
pub trait Profiler {
    /// Whether any hook does real work
    fn is_enabled(&self) -> bool {
        false
    }

    /// A slot was pushed
    fn on_stack_push(&mut self, _depth: DepthFn<'_>) {}

    /// A heap operation starts
    fn heap_event_start(&mut self) {}

    /// The heap operation started last ends
    fn heap_event_end(&mut self, _kind: HeapEventKind, _depth: DepthFn<'_>) {}

    /// `bytes` were handed out
    fn on_alloc(&mut self, _bytes: usize) {}

    /// `bytes` were reclaimed
    fn on_free(&mut self, _bytes: usize) {}

    /// Flush and terminate the logs
    fn close(&mut self) -> RuntimeResult<()> {
        Ok(())
    }
}

/// Profiler that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfiler;

impl Profiler for NoopProfiler {}

/// Build the profiler selected by `config`
pub fn from_config(config: &ProfilingConfig) -> RuntimeResult<Box<dyn Profiler>> {
    if !config.enabled {
        return Ok(Box::new(NoopProfiler));
    }
    let stack = BufWriter::new(File::create(&config.stack_log)?);
    let heap = BufWriter::new(File::create(&config.heap_log)?);
    log::info!(
        "profiling to {} and {} every {} events",
        config.stack_log.display(),
        config.heap_log.display(),
        config.frequency
    );
    Ok(Box::new(JsonProfiler::new(stack, heap, config.frequency)))
}

/// One stack sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    /// Nanoseconds since the profiler was created
    pub ticks: u64,
    /// Same instant in seconds
    pub seconds: f64,
    /// Number of pushes so far
    pub stack_count: u64,
    /// Stack depth in slots
    pub stack_offset: usize,
}

/// One heap event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapRecord {
    /// Operation that ended
    pub event: HeapEventKind,
    /// Nanoseconds since the profiler was created
    pub ticks: u64,
    /// Same instant in seconds
    pub seconds: f64,
    /// Stack depth in slots
    pub stack_offset: usize,
    /// Bytes allocated and not yet freed
    pub currently_allocated_bytes: usize,
    /// Objects allocated so far
    pub total_allocated_objects: u64,
    /// Bytes allocated so far
    pub total_allocated_bytes: u64,
    /// Nanoseconds spent in heap operations so far
    pub total_pause_ticks: u64,
    /// Same duration in seconds
    pub total_pause_secs: f64,
    /// Nanoseconds spent in allocations so far
    pub total_alloc_pause_ticks: u64,
}

/// Writes a JSON array one element at a time
struct ArrayWriter<W: Write> {
    sink: W,
    empty: bool,
}

impl<W: Write> ArrayWriter<W> {
    fn new(sink: W) -> Self {
        Self { sink, empty: true }
    }

    fn push<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        self.sink.write_all(if self.empty { b"[\n" } else { b",\n" })?;
        self.empty = false;
        serde_json::to_writer(&mut self.sink, record)?;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.sink.write_all(if self.empty { b"[]\n" } else { b"\n]\n" })?;
        self.sink.flush()
    }
}

fn ticks(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}

/// Profiler emitting JSON event logs
pub struct JsonProfiler<W: Write> {
    epoch: Instant,
    frequency: u64,
    stack: ArrayWriter<W>,
    heap: ArrayWriter<W>,

    stack_count: u64,
    heap_count: u64,
    event_start: Option<Instant>,

    currently_allocated: usize,
    total_objects: u64,
    total_bytes: u64,
    total_pause: Duration,
    total_alloc_pause: Duration,

    error: Option<io::Error>,
    closed: bool,
}

impl<W: Write> JsonProfiler<W> {
    /// Log stack samples to `stack` and heap events to `heap`
    pub fn new(stack: W, heap: W, frequency: u64) -> Self {
        let mut profiler = Self {
            epoch: Instant::now(),
            frequency: frequency.max(1),
            stack: ArrayWriter::new(stack),
            heap: ArrayWriter::new(heap),
            stack_count: 0,
            heap_count: 0,
            event_start: None,
            currently_allocated: 0,
            total_objects: 0,
            total_bytes: 0,
            total_pause: Duration::ZERO,
            total_alloc_pause: Duration::ZERO,
            error: None,
            closed: false,
        };
        let first = StackRecord {
            ticks: 0,
            seconds: 0.0,
            stack_count: 0,
            stack_offset: 0,
        };
        let result = profiler.stack.push(&first);
        profiler.remember(result);
        profiler
    }

    /// Give back the sinks, e.g. to inspect in-memory logs
    ///
    /// Logs that were not closed are handed back unterminated.
    pub fn into_sinks(mut self) -> (W, W)
    where
        W: Default,
    {
        self.closed = true;
        (
            std::mem::take(&mut self.stack.sink),
            std::mem::take(&mut self.heap.sink),
        )
    }

    fn remember(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if self.error.is_none() {
                log::error!("profiling sink failed: {}", err);
                self.error = Some(err);
            }
        }
    }

    fn sampled(count: u64, frequency: u64) -> bool {
        count % frequency == 0
    }
}

impl<W: Write> Profiler for JsonProfiler<W> {
    fn is_enabled(&self) -> bool {
        !self.closed
    }

    fn on_stack_push(&mut self, depth: DepthFn<'_>) {
        self.stack_count += 1;
        if !Self::sampled(self.stack_count, self.frequency) {
            return;
        }
        let elapsed = self.epoch.elapsed();
        let record = StackRecord {
            ticks: ticks(elapsed),
            seconds: elapsed.as_secs_f64(),
            stack_count: self.stack_count,
            stack_offset: depth(),
        };
        let result = self.stack.push(&record);
        self.remember(result);
    }

    fn heap_event_start(&mut self) {
        self.event_start = Some(Instant::now());
    }

    fn heap_event_end(&mut self, kind: HeapEventKind, depth: DepthFn<'_>) {
        let pause = self
            .event_start
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
        self.total_pause += pause;
        if kind == HeapEventKind::TypeAlloc {
            self.total_alloc_pause += pause;
        }

        self.heap_count += 1;
        if !Self::sampled(self.heap_count, self.frequency) {
            return;
        }
        let elapsed = self.epoch.elapsed();
        let record = HeapRecord {
            event: kind,
            ticks: ticks(elapsed),
            seconds: elapsed.as_secs_f64(),
            stack_offset: depth(),
            currently_allocated_bytes: self.currently_allocated,
            total_allocated_objects: self.total_objects,
            total_allocated_bytes: self.total_bytes,
            total_pause_ticks: ticks(self.total_pause),
            total_pause_secs: self.total_pause.as_secs_f64(),
            total_alloc_pause_ticks: ticks(self.total_alloc_pause),
        };
        let result = self.heap.push(&record);
        self.remember(result);
    }

    fn on_alloc(&mut self, bytes: usize) {
        self.currently_allocated += bytes;
        self.total_objects += 1;
        self.total_bytes += bytes as u64;
    }

    fn on_free(&mut self, bytes: usize) {
        self.currently_allocated = self.currently_allocated.saturating_sub(bytes);
    }

    fn close(&mut self) -> RuntimeResult<()> {
        if !self.closed {
            self.closed = true;
            let result = self.stack.finish().and_then(|_| self.heap.finish());
            self.remember(result);
        }
        match self.error.take() {
            Some(err) => Err(RuntimeError::Io(err)),
            None => Ok(()),
        }
    }
}

impl<W: Write> Drop for JsonProfiler<W> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = Profiler::close(self) {
                log::warn!("profiling logs closed on drop: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(bytes: &[u8]) -> Vec<Value> {
        serde_json::from_slice::<Vec<Value>>(bytes).unwrap()
    }

    #[test]
    fn test_noop_profiler_is_disabled() {
        let mut profiler = NoopProfiler;
        assert!(!profiler.is_enabled());
        profiler.on_stack_push(&|| 0);
        assert!(profiler.close().is_ok());
    }

    #[test]
    fn test_empty_logs_are_valid_json() {
        let mut profiler = JsonProfiler::new(Vec::new(), Vec::new(), 1);
        profiler.close().unwrap();
        let (stack, heap) = profiler.into_sinks();

        assert_eq!(parse(&stack).len(), 1);
        assert!(parse(&heap).is_empty());
    }

    #[test]
    fn test_stack_samples_respect_frequency() {
        let mut profiler = JsonProfiler::new(Vec::new(), Vec::new(), 3);
        for depth in 1..=9 {
            profiler.on_stack_push(&|| depth);
        }
        profiler.close().unwrap();
        let (stack, _) = profiler.into_sinks();

        let records = parse(&stack);
        assert_eq!(records.len(), 4);
        assert_eq!(records[1]["stack_count"], 3);
        assert_eq!(records[3]["stack_offset"], 9);
    }

    #[test]
    fn test_heap_records_track_bytes() {
        let mut profiler = JsonProfiler::new(Vec::new(), Vec::new(), 1);
        profiler.heap_event_start();
        profiler.on_alloc(32);
        profiler.heap_event_end(HeapEventKind::TypeAlloc, &|| 2);
        profiler.heap_event_start();
        profiler.on_alloc(16);
        profiler.heap_event_end(HeapEventKind::TypeAlloc, &|| 2);
        profiler.heap_event_start();
        profiler.on_free(32);
        profiler.heap_event_end(HeapEventKind::Tgc, &|| 1);
        profiler.close().unwrap();
        let (_, heap) = profiler.into_sinks();

        let records = parse(&heap);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["event"], "type_alloc");
        assert_eq!(records[1]["currently_allocated_bytes"], 48);
        assert_eq!(records[2]["event"], "tgc");
        assert_eq!(records[2]["currently_allocated_bytes"], 16);
        assert_eq!(records[2]["total_allocated_objects"], 2);
        assert_eq!(records[2]["total_allocated_bytes"], 48);
        assert_eq!(records[2]["stack_offset"], 1);
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_failure_is_reported_on_close() {
        let mut profiler = JsonProfiler::new(FailingSink, FailingSink, 1);
        profiler.on_stack_push(&|| 1);
        assert!(matches!(profiler.close(), Err(RuntimeError::Io(_))));
        assert!(!profiler.is_enabled());
    }

    #[test]
    fn test_drop_terminates_logs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProfilingConfig {
            enabled: true,
            frequency: 1,
            stack_log: dir.path().join("stack.json"),
            heap_log: dir.path().join("heap.json"),
        };

        let mut profiler = from_config(&config).unwrap();
        profiler.on_stack_push(&|| 1);
        profiler.heap_event_start();
        profiler.on_alloc(16);
        profiler.heap_event_end(HeapEventKind::TypeAlloc, &|| 1);
        drop(profiler);

        let stack = std::fs::read(&config.stack_log).unwrap();
        assert_eq!(parse(&stack).len(), 2);
        let heap = std::fs::read(&config.heap_log).unwrap();
        assert_eq!(parse(&heap).len(), 1);
    }

    #[test]
    fn test_from_config_disabled() {
        let profiler = from_config(&ProfilingConfig::default()).unwrap();
        assert!(!profiler.is_enabled());
    }

    #[test]
    fn test_from_config_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProfilingConfig {
            enabled: true,
            frequency: 1,
            stack_log: dir.path().join("stack.json"),
            heap_log: dir.path().join("heap.json"),
        };

        let mut profiler = from_config(&config).unwrap();
        profiler.on_stack_push(&|| 1);
        profiler.close().unwrap();

        let stack = std::fs::read(&config.stack_log).unwrap();
        assert_eq!(parse(&stack).len(), 2);
        let heap = std::fs::read(&config.heap_log).unwrap();
        assert!(parse(&heap).is_empty());
    }
}
