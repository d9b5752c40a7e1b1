//! # region-cli
//!
//! Workload runner and GC benchmark harness for the region-rs runtime.
//! Workloads are compiled in; the harness wraps each run with a measurement
//! callback and prints aggregate statistics (or JSON with `--json`).
use clap::Parser;
use region_rt::metrics::GcBenchmark;
use std::process::ExitCode;

pub mod error;
pub mod workloads;

use error::WorkloadError;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Workload and GC benchmark runner for the region-rs runtime"
)]
pub struct Args {
    /// Workload to run: grid-walkers, game-of-life or cycle-churn
    #[arg(value_name = "WORKLOAD")]
    pub workload: String,

    /// Grid / board edge length
    #[arg(long, default_value_t = 20)]
    pub size: usize,

    /// Steps (grid-walkers), generations (game-of-life) or iterations
    /// (cycle-churn) per run
    #[arg(long, default_value_t = 100)]
    pub steps: usize,

    /// Number of walkers (grid-walkers) or cycle length (cycle-churn)
    #[arg(long, default_value_t = 10)]
    pub walkers: usize,

    /// Random seed for workloads that use one
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Measured runs
    #[arg(long, default_value_t = 5)]
    pub runs: usize,

    /// Unmeasured warmup runs
    #[arg(long, default_value_t = 2)]
    pub warmup: usize,

    /// Emit the summary as JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

fn run_workload(args: &Args) -> Result<(), WorkloadError> {
    match args.workload.as_str() {
        "grid-walkers" => workloads::grid_walkers(args.size, args.steps, args.walkers, args.seed),
        "game-of-life" => workloads::game_of_life(args.size, args.steps),
        "cycle-churn" => workloads::cycle_churn(args.walkers, args.steps),
        other => Err(WorkloadError::UnknownWorkload(other.to_string())),
    }
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    // fail fast on bad input before entering the measurement loop
    if let Err(e) = run_workload(&args) {
        eprintln!("Error: {}", e);
        return ExitCode::from(1);
    }

    let mut benchmark = GcBenchmark::new();
    benchmark.run_benchmark(
        || {
            run_workload(&args).expect("workload failed after validation run");
        },
        args.runs,
        args.warmup,
    );

    let summary = benchmark.summary();
    if args.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing summary: {}", e);
                return ExitCode::from(1);
            }
        }
    } else {
        println!("{}", "=".repeat(50));
        println!("GC Benchmark Summary: {}", args.workload);
        println!("{}", "=".repeat(50));
        print!("{}", summary);
    }

    region_rt::sched::wait_idle();
    region_utils::heap::debug_check_empty();
    ExitCode::SUCCESS
}
