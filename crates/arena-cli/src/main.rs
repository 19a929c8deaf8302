//! Arena command-line driver
//!
//! Runs synthetic allocation workloads against either heap backend and
//! summarizes the heap logs written by the profiler.

mod commands;
mod workload;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use workload::{Backend, Workload};

#[derive(Parser)]
#[command(name = "arena")]
#[command(about = "Arena memory runtime driver", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic workload
    Run {
        /// Allocation pattern
        #[arg(value_enum)]
        workload: Workload,
        /// Heap backend
        #[arg(short, long, value_enum, default_value_t = Backend::Tgc)]
        backend: Backend,
        /// Runtime configuration file (arena.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// List length, tree depth, object count or stack depth
        #[arg(short, long)]
        size: Option<usize>,
        /// Write profiling logs
        #[arg(long)]
        profile: bool,
    },

    /// Summarize a heap profiling log
    Stats {
        /// Heap log written by `arena run --profile`
        log: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            workload,
            backend,
            config,
            size,
            profile,
        } => commands::run::execute(commands::run::RunArgs {
            workload,
            backend,
            config,
            size,
            profile,
        }),

        Commands::Stats { log } => commands::stats::execute(&log),
    }
}
