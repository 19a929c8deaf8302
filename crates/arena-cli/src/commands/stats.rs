//! `arena stats`: summarize a heap profiling log.

use anyhow::Context;
use arena_runtime::{HeapEventKind, HeapRecord};
use std::path::Path;

/// Aggregates over one heap log
#[derive(Debug, Clone, PartialEq)]
pub struct LogStats {
    pub records: usize,
    pub events: Vec<(HeapEventKind, usize)>,
    pub total_allocated_objects: u64,
    pub total_allocated_bytes: u64,
    pub total_pause_secs: f64,
    pub total_alloc_pause_ticks: u64,
    pub elapsed_secs: f64,
    pub mean_allocated_bytes: f64,
    pub mean_stack_offset: f64,
}

impl LogStats {
    /// Share of the run spent inside heap operations
    pub fn pause_ratio(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.total_pause_secs / self.elapsed_secs
        } else {
            0.0
        }
    }
}

pub fn execute(path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let records: Vec<HeapRecord> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a heap profiling log", path.display()))?;

    let Some(stats) = summarize(&records) else {
        println!("{}: no heap events", path.display());
        return Ok(());
    };

    println!("Records:             {}", stats.records);
    for (kind, count) in &stats.events {
        println!("  {:<18} {}", format!("{:?}", kind), count);
    }
    println!("Allocated objects:   {}", stats.total_allocated_objects);
    println!("Allocated bytes:     {}", stats.total_allocated_bytes);
    println!("Mean live bytes:     {:.1}", stats.mean_allocated_bytes);
    println!("Mean stack depth:    {:.1}", stats.mean_stack_offset);
    println!("Alloc pause:         {} ns", stats.total_alloc_pause_ticks);
    println!(
        "Heap pause:          {:.6} s of {:.6} s ({:.2}%)",
        stats.total_pause_secs,
        stats.elapsed_secs,
        stats.pause_ratio() * 100.0
    );
    Ok(())
}

/// Totals come from the last record, means from all of them
pub fn summarize(records: &[HeapRecord]) -> Option<LogStats> {
    let last = records.last()?;
    let n = records.len() as f64;

    let mut events: Vec<(HeapEventKind, usize)> = Vec::new();
    for record in records {
        match events.iter_mut().find(|(kind, _)| *kind == record.event) {
            Some((_, count)) => *count += 1,
            None => events.push((record.event, 1)),
        }
    }

    Some(LogStats {
        records: records.len(),
        events,
        total_allocated_objects: last.total_allocated_objects,
        total_allocated_bytes: last.total_allocated_bytes,
        total_pause_secs: last.total_pause_secs,
        total_alloc_pause_ticks: last.total_alloc_pause_ticks,
        elapsed_secs: last.seconds,
        mean_allocated_bytes: records
            .iter()
            .map(|r| r.currently_allocated_bytes as f64)
            .sum::<f64>()
            / n,
        mean_stack_offset: records.iter().map(|r| r.stack_offset as f64).sum::<f64>() / n,
    })
}
