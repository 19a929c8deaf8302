//! `arena run`: drive one workload and print what the runtime did.

use crate::workload::{self, Backend, Summary, Workload};
use anyhow::Context;
use arena_runtime::RuntimeConfig;
use std::path::{Path, PathBuf};

pub struct RunArgs {
    pub workload: Workload,
    pub backend: Backend,
    pub config: Option<PathBuf>,
    pub size: Option<usize>,
    pub profile: bool,
}

pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref(), args.profile)?;
    let size = args.size.unwrap_or_else(|| args.workload.default_size());

    let summary = workload::run(args.workload, args.backend, size, &config)
        .with_context(|| format!("{} workload failed on {}", args.workload, args.backend))?;
    print_summary(&summary);

    if config.profiling.enabled {
        println!(
            "Profiling logs: {}, {}",
            config.profiling.stack_log.display(),
            config.profiling.heap_log.display()
        );
    }
    Ok(())
}

/// Read the configuration file if given; `--profile` forces profiling on
fn load_config(path: Option<&Path>, profile: bool) -> anyhow::Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    if profile {
        config.profiling.enabled = true;
    }
    Ok(config)
}

fn print_summary(summary: &Summary) {
    println!("Workload:        {} ({})", summary.workload, summary.size);
    println!("Backend:         {}", summary.backend);
    println!("Elapsed:         {:.3?}", summary.elapsed);
    println!("Objects:         {} allocated, {} reachable", summary.objects, summary.visited);
    println!("Stack:           {} slots deep, {} segments", summary.max_depth, summary.segments);
    println!("Freed:           {} bytes", summary.freed_bytes);
    if summary.backend == Backend::Tgc {
        println!(
            "Collections:     {} (max pause {:.3?})",
            summary.collections, summary.max_pause
        );
    }
    if summary.report.is_clean() {
        println!("Shutdown:        clean");
    } else {
        println!(
            "Shutdown:        {} objects ({} bytes) leaked",
            summary.report.live_objects, summary.report.live_bytes
        );
    }
}
