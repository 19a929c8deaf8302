//! Synthetic workloads
//!
//! Each workload exercises one allocation pattern through a [`Runtime`]:
//! - `list`: a singly linked list built by prepending
//! - `tree`: a complete binary tree built bottom-up
//! - `churn`: short-lived objects cycling through a small window of roots
//! - `stack`: deep push/pop rounds without any allocation
//!
//! TGC workloads keep every live object reachable from a stack slot and
//! re-read slots after each allocation, since a collection may move objects.

use arena_runtime::header::min_object_len;
use arena_runtime::{
    ArcHeader, ArcRuntime, Heap, ObjRef, Runtime, RuntimeConfig, RuntimeResult, ShutdownReport,
    StackPtr, TgcHeader, TgcRuntime,
};
use clap::ValueEnum;
use std::fmt;
use std::time::{Duration, Instant};

/// Number of stack slots the churn workload roots objects in
const CHURN_WINDOW: usize = 32;

/// Rounds of the stack workload
const STACK_ROUNDS: usize = 3;

/// Allocation pattern to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Workload {
    /// Linked list of `size` nodes
    List,
    /// Complete binary tree of depth `size`
    Tree,
    /// `size` short-lived objects
    Churn,
    /// Push and pop `size` slots, three times
    Stack,
}

impl Workload {
    /// Size used when none is given; fits the default nursery
    pub fn default_size(self) -> usize {
        match self {
            Workload::List => 256,
            Workload::Tree => 7,
            Workload::Churn => 100_000,
            Workload::Stack => 10_000,
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Workload::List => "list",
            Workload::Tree => "tree",
            Workload::Churn => "churn",
            Workload::Stack => "stack",
        };
        f.write_str(name)
    }
}

/// Heap backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Reference counting
    Arc,
    /// Copying collection
    Tgc,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Arc => "arc",
            Backend::Tgc => "tgc",
        })
    }
}

/// What a workload did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    /// Objects allocated
    objects: usize,
    /// Objects reachable at the end, counted by walking the graph
    visited: usize,
    /// Deepest stack seen, in slots
    max_depth: usize,
}

/// Result of one run
#[derive(Debug, Clone)]
pub struct Summary {
    pub workload: Workload,
    pub backend: Backend,
    pub size: usize,
    pub objects: usize,
    pub visited: usize,
    pub max_depth: usize,
    pub segments: usize,
    pub collections: usize,
    pub freed_bytes: usize,
    pub max_pause: Duration,
    pub elapsed: Duration,
    pub report: ShutdownReport,
}

/// Run `workload` on `backend` with a runtime built from `config`
pub fn run(
    workload: Workload,
    backend: Backend,
    size: usize,
    config: &RuntimeConfig,
) -> RuntimeResult<Summary> {
    log::info!("running {} ({}) on {}", workload, size, backend);
    let start = Instant::now();

    let mut summary = match backend {
        Backend::Arc => {
            let mut rt = ArcRuntime::new(config)?;
            let outcome = match workload {
                Workload::List => arc_list(&mut rt, size)?,
                Workload::Tree => arc_tree(&mut rt, size)?,
                Workload::Churn => arc_churn(&mut rt, size)?,
                Workload::Stack => stack_rounds(&mut rt, size)?,
            };
            let stats = rt.heap().stats().clone();
            let segments = rt.stack().segment_count();
            Summary {
                collections: 0,
                freed_bytes: stats.freed_bytes,
                max_pause: Duration::ZERO,
                ..summarize(workload, backend, size, outcome, segments, rt.shutdown()?)
            }
        }
        Backend::Tgc => {
            let mut rt = TgcRuntime::new(config)?;
            let outcome = match workload {
                Workload::List => tgc_list(&mut rt, size)?,
                Workload::Tree => tgc_tree(&mut rt, size)?,
                Workload::Churn => tgc_churn(&mut rt, size)?,
                Workload::Stack => stack_rounds(&mut rt, size)?,
            };
            let stats = rt.heap().stats().clone();
            let segments = rt.stack().segment_count();
            Summary {
                collections: stats.collections,
                freed_bytes: stats.bytes_freed,
                max_pause: stats.max_pause_time,
                ..summarize(workload, backend, size, outcome, segments, rt.shutdown()?)
            }
        }
    };

    summary.elapsed = start.elapsed();
    Ok(summary)
}

fn summarize(
    workload: Workload,
    backend: Backend,
    size: usize,
    outcome: Outcome,
    segments: usize,
    report: ShutdownReport,
) -> Summary {
    Summary {
        workload,
        backend,
        size,
        objects: outcome.objects,
        visited: outcome.visited,
        max_depth: outcome.max_depth,
        segments,
        collections: 0,
        freed_bytes: 0,
        max_pause: Duration::ZERO,
        elapsed: Duration::ZERO,
        report,
    }
}

/// Count the objects reachable from `root`; the graph must be a tree
fn count_reachable<F>(root: Option<ObjRef>, mut children: F) -> RuntimeResult<usize>
where
    F: FnMut(ObjRef, &mut Vec<ObjRef>) -> RuntimeResult<()>,
{
    let mut pending: Vec<ObjRef> = root.into_iter().collect();
    let mut count = 0;
    while let Some(obj) = pending.pop() {
        count += 1;
        children(obj, &mut pending)?;
    }
    Ok(count)
}

fn stack_rounds<H: Heap>(rt: &mut Runtime<H>, size: usize) -> RuntimeResult<Outcome> {
    let mut outcome = Outcome::default();
    for _ in 0..STACK_ROUNDS {
        let mut sp = rt.base();
        for _ in 0..size {
            sp = rt.push(sp)?;
        }
        outcome.max_depth = outcome.max_depth.max(rt.depth(sp)?);
        for _ in 0..size {
            sp = rt.pop(sp)?;
        }
    }
    Ok(outcome)
}

// ============================================================================
// ARC
// ============================================================================

/// Allocate an object owned by one reference; takes over one reference of
/// every child
fn arc_node(
    rt: &mut ArcRuntime,
    sp: StackPtr,
    children: &[Option<ObjRef>],
    payload: usize,
) -> RuntimeResult<ObjRef> {
    let count = children.len() as u16;
    let obj = rt.allocate(min_object_len(count) + payload, sp)?;
    rt.heap_mut().set_header(obj, ArcHeader::new(count))?;
    rt.access(obj, sp)?;
    for (index, child) in children.iter().enumerate() {
        rt.heap_mut().set_child(obj, index, *child)?;
    }
    Ok(obj)
}

fn count_arc(rt: &ArcRuntime, root: Option<ObjRef>) -> RuntimeResult<usize> {
    let heap = rt.heap();
    count_reachable(root, |obj, out| {
        for index in 0..heap.header(obj)?.pointer_count as usize {
            out.extend(heap.child(obj, index)?);
        }
        Ok(())
    })
}

fn arc_list(rt: &mut ArcRuntime, size: usize) -> RuntimeResult<Outcome> {
    let sp = rt.base();
    let mut head = None;
    for _ in 0..size {
        head = Some(arc_node(rt, sp, &[head], 8)?);
    }

    let visited = count_arc(rt, head)?;
    if let Some(head) = head {
        rt.release(head, sp)?;
    }
    Ok(Outcome {
        objects: size,
        visited,
        max_depth: 0,
    })
}

fn arc_tree(rt: &mut ArcRuntime, depth: usize) -> RuntimeResult<Outcome> {
    fn build(rt: &mut ArcRuntime, sp: StackPtr, depth: usize, max: &mut usize) -> RuntimeResult<ObjRef> {
        // one slot per frame, for the stack profile
        let frame = rt.push(sp)?;
        if depth == 0 {
            *max = (*max).max(rt.depth(frame)?);
            return arc_node(rt, frame, &[], 8);
        }
        let left = build(rt, frame, depth - 1, max)?;
        let right = build(rt, frame, depth - 1, max)?;
        arc_node(rt, frame, &[Some(left), Some(right)], 0)
    }

    let mut max_depth = 0;
    let sp = rt.base();
    let root = build(rt, sp, depth, &mut max_depth)?;
    let visited = count_arc(rt, Some(root))?;
    rt.release(root, sp)?;
    Ok(Outcome {
        objects: visited,
        visited,
        max_depth,
    })
}

fn arc_churn(rt: &mut ArcRuntime, size: usize) -> RuntimeResult<Outcome> {
    let sp = rt.base();
    let mut window: Vec<Option<ObjRef>> = vec![None; CHURN_WINDOW];
    for i in 0..size {
        let obj = arc_node(rt, sp, &[], 8 + i % 24)?;
        if let Some(old) = window[i % CHURN_WINDOW].replace(obj) {
            rt.release(old, sp)?;
        }
    }

    let live: Vec<ObjRef> = window.into_iter().flatten().collect();
    let visited = live.len();
    for obj in live {
        rt.release(obj, sp)?;
    }
    Ok(Outcome {
        objects: size,
        visited,
        max_depth: 0,
    })
}

// ============================================================================
// TGC
// ============================================================================

/// Allocate an object whose children are the values of `children` slots
///
/// The slots are read after the allocation, which may have moved them.
fn tgc_node(
    rt: &mut TgcRuntime,
    sp: StackPtr,
    children: &[StackPtr],
    payload: usize,
) -> RuntimeResult<ObjRef> {
    let count = children.len() as u16;
    let len = min_object_len(count) + payload;
    let obj = rt.allocate(len, sp)?;
    rt.heap_mut().set_header(obj, TgcHeader::new(len as u32, count))?;
    for (index, slot) in children.iter().enumerate() {
        let child = rt.read(*slot)?;
        rt.heap_mut().set_child(obj, index, child)?;
    }
    Ok(obj)
}

fn count_tgc(rt: &TgcRuntime, root: Option<ObjRef>) -> RuntimeResult<usize> {
    let heap = rt.heap();
    count_reachable(root, |obj, out| {
        for index in 0..heap.header(obj)?.pointer_count as usize {
            out.extend(heap.child(obj, index)?);
        }
        Ok(())
    })
}

fn tgc_list(rt: &mut TgcRuntime, size: usize) -> RuntimeResult<Outcome> {
    let head = rt.push(rt.base())?;
    for _ in 0..size {
        let node = tgc_node(rt, head, &[head], 8)?;
        rt.write(head, Some(node))?;
    }

    let visited = count_tgc(rt, rt.read(head)?)?;
    rt.write(head, None)?;
    let sp = rt.pop(head)?;
    rt.collect(sp)?;
    Ok(Outcome {
        objects: size,
        visited,
        max_depth: 1,
    })
}

fn tgc_tree(rt: &mut TgcRuntime, depth: usize) -> RuntimeResult<Outcome> {
    /// Build a subtree and push its root
    fn build(rt: &mut TgcRuntime, sp: StackPtr, depth: usize, max: &mut usize) -> RuntimeResult<StackPtr> {
        if depth == 0 {
            let leaf = tgc_node(rt, sp, &[], 8)?;
            let top = rt.push_value(sp, Some(leaf))?;
            *max = (*max).max(rt.depth(top)?);
            return Ok(top);
        }
        let left = build(rt, sp, depth - 1, max)?;
        let right = build(rt, left, depth - 1, max)?;
        let node = tgc_node(rt, right, &[left, right], 0)?;
        let sp = rt.pop(rt.pop(right)?)?;
        rt.push_value(sp, Some(node))
    }

    let mut max_depth = 0;
    let base = rt.base();
    let root = build(rt, base, depth, &mut max_depth)?;
    let visited = count_tgc(rt, rt.read(root)?)?;
    rt.write(root, None)?;
    let sp = rt.pop(root)?;
    rt.collect(sp)?;
    Ok(Outcome {
        objects: visited,
        visited,
        max_depth,
    })
}

fn tgc_churn(rt: &mut TgcRuntime, size: usize) -> RuntimeResult<Outcome> {
    let mut slots = Vec::with_capacity(CHURN_WINDOW);
    let mut sp = rt.base();
    for _ in 0..CHURN_WINDOW {
        sp = rt.push(sp)?;
        slots.push(sp);
    }

    for i in 0..size {
        let obj = tgc_node(rt, sp, &[], 8 + i % 24)?;
        rt.write(slots[i % CHURN_WINDOW], Some(obj))?;
    }

    let mut visited = 0;
    for slot in &slots {
        if rt.read(*slot)?.is_some() {
            visited += 1;
        }
        rt.write(*slot, None)?;
    }
    Ok(Outcome {
        objects: size,
        visited,
        max_depth: CHURN_WINDOW,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_default(workload: Workload, backend: Backend, size: usize) -> Summary {
        run(workload, backend, size, &RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_list_on_both_backends() {
        for backend in [Backend::Arc, Backend::Tgc] {
            let summary = run_default(Workload::List, backend, 100);
            assert_eq!(summary.visited, 100);
            assert!(summary.report.is_clean());
        }
    }

    #[test]
    fn test_tree_counts_every_node() {
        for backend in [Backend::Arc, Backend::Tgc] {
            let summary = run_default(Workload::Tree, backend, 5);
            assert_eq!(summary.visited, 63);
            assert!(summary.max_depth > 5);
            assert!(summary.report.is_clean());
        }
    }

    #[test]
    fn test_tgc_tree_in_small_nursery() {
        let mut config = RuntimeConfig::default();
        config.heap.nursery_bits = 12;
        let summary = run(Workload::Tree, Backend::Tgc, 6, &config).unwrap();
        assert_eq!(summary.visited, 127);
        // the final collection after dropping the root
        assert_eq!(summary.collections, 1);
        assert_eq!(summary.freed_bytes, 64 * 16 + 63 * 24);
    }

    #[test]
    fn test_churn_collects_on_tgc() {
        let summary = run_default(Workload::Churn, Backend::Tgc, 5_000);
        assert_eq!(summary.visited, CHURN_WINDOW);
        assert!(summary.collections > 0);
        assert!(summary.report.is_clean());
    }

    #[test]
    fn test_churn_frees_everything_on_arc() {
        let summary = run_default(Workload::Churn, Backend::Arc, 1_000);
        assert_eq!(summary.visited, CHURN_WINDOW);
        assert!(summary.report.is_clean());
    }

    #[test]
    fn test_stack_rounds_reuse_segments() {
        let summary = run_default(Workload::Stack, Backend::Arc, 300);
        assert_eq!(summary.max_depth, 300);
        // 30 value slots per default segment
        assert_eq!(summary.segments, 10);
        assert_eq!(summary.objects, 0);
    }

    #[test]
    fn test_tgc_list_too_large_for_nursery() {
        let mut config = RuntimeConfig::default();
        config.heap.nursery_bits = 8;
        assert!(run(Workload::List, Backend::Tgc, 100, &config).is_err());
    }
}
