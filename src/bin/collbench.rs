//! Collective latency benchmark.
//!
//! # Usage
//!
//! ```bash
//! # Four in-process ranks, sizes from default_messages.txt, 10 s budget
//! collbench -v
//!
//! # Fixed-size all-gather, capped at 1000 trials
//! collbench -c allgather --baseline 4096 --max-trials 1000 -o allgather.csv
//!
//! # Size sweep, one table line per size
//! collbench -v -c scatterv --pattern increasing --sizes 1024,4096,16384
//! collbench -v -c bcast --min-size 8 --max-size 1048576
//!
//! # Per-peer matrix for all-to-all
//! collbench -c alltoallv -m matrix.txt --np 8
//!
//! # Over MPI
//! cargo build --release --features mpi
//! mpiexec -n 16 target/release/collbench -c scatterv -m sizes.txt -t 30
//! ```
//!
//! Log verbosity follows `RUST_LOG` when set; otherwise `-v` enables info
//! and `-vv` debug output on stderr. Summary tables go to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::error;

use collbench::bench::{run_or_abort, sweep_or_abort};
use collbench::config::DEFAULT_MESSAGES;
use collbench::plan::doubling_sizes;
use collbench::{
    BenchConfig, Collective, Communicator, ElementKind, EnvOverrides, Pattern, RecordFormat,
    Result, SizeSpec,
};

/// Time collective data-movement operations across a group of processes.
#[derive(Parser, Debug)]
#[command(name = "collbench", version, about)]
struct Args {
    /// Messages source: one row of per-process counts, or one row per process for alltoallv
    #[arg(short = 'm', long = "fmessages")]
    fmessages: Option<PathBuf>,

    /// Output record (CSV, appended to)
    #[arg(short = 'o', long = "foutput")]
    foutput: Option<PathBuf>,

    /// Do not write an output record
    #[arg(long, conflicts_with = "foutput")]
    no_output: bool,

    /// Trial-loop budget in seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Print summary tables; repeat for more log output
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Collective to time
    #[arg(short, long, default_value = "scatterv")]
    collective: Collective,

    /// Spread a baseline size instead of reading the messages source
    #[arg(long)]
    baseline: Option<u64>,

    /// Sweep these baseline sizes in one launch (comma-separated bytes)
    #[arg(long, value_delimiter = ',', conflicts_with_all = ["baseline", "min_size"])]
    sizes: Option<Vec<u64>>,

    /// Sweep baseline sizes doubling from this many bytes
    #[arg(long, requires = "max_size", conflicts_with = "baseline")]
    min_size: Option<u64>,

    /// Largest size of a doubling sweep
    #[arg(long, requires = "min_size")]
    max_size: Option<u64>,

    /// How the baseline grows across processes
    #[arg(long, default_value = "uniform")]
    pattern: Pattern,

    /// Untimed invocations before the deadline reference is taken
    #[arg(long)]
    warmup: Option<usize>,

    /// Stop after this many trials even if the budget is not spent
    #[arg(long)]
    max_trials: Option<u64>,

    /// Payload element type (f64, i32, u8)
    #[arg(long, default_value = "f64")]
    element: ElementKind,

    /// Record layout (latency, startend)
    #[arg(long, default_value = "latency")]
    format: RecordFormat,

    /// Smallest allowed non-empty message buffer in bytes
    #[arg(long)]
    min_bytes: Option<u64>,

    /// Largest allowed message buffer in bytes
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Number of in-process ranks (ignored under MPI)
    #[arg(long, default_value_t = 4)]
    np: usize,
}

impl Args {
    /// Defaults, then environment, then flags.
    fn config(&self) -> BenchConfig {
        let mut config = BenchConfig::default().with_env_overrides(&EnvOverrides::from_env());

        config.collective = self.collective;
        config.element = self.element;
        config.format = self.format;
        config.verbose = self.verbose > 0;
        config.sizes = match (self.baseline, &self.fmessages) {
            (Some(bytes), _) => SizeSpec::Baseline {
                bytes,
                pattern: self.pattern,
            },
            (None, path) => {
                let path = path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_MESSAGES));
                if self.collective == Collective::Alltoallv {
                    SizeSpec::Matrix(path)
                } else {
                    SizeSpec::Row(path)
                }
            }
        };
        if let Some(timeout) = self.timeout {
            config.trials.budget = timeout;
        }
        if let Some(warmup) = self.warmup {
            config.trials.warmup = warmup;
        }
        if let Some(cap) = self.max_trials {
            config.trials.max_trials = Some(cap);
        }
        if let Some(path) = &self.foutput {
            config.output = Some(path.clone());
        }
        if self.no_output {
            config.output = None;
        }
        if let Some(min) = self.min_bytes {
            config.envelope.min_bytes = min;
        }
        if let Some(max) = self.max_bytes {
            config.envelope.max_bytes = max;
        }
        config
    }

    /// Sizes of a sweep, if one was requested.
    fn sweep(&self) -> Option<Vec<u64>> {
        match (&self.sizes, self.min_size, self.max_size) {
            (Some(sizes), _, _) => Some(sizes.clone()),
            (None, Some(min), Some(max)) => Some(doubling_sizes(min, max)),
            _ => None,
        }
    }
}

/// One run, or a sweep when sizes were given. Returns the rows written.
fn bench_on<C: Communicator>(comm: &C, args: &Args, config: &BenchConfig) -> Result<usize> {
    match args.sweep() {
        Some(sizes) => {
            let reports = sweep_or_abort(comm, config, &sizes, args.pattern)?;
            Ok(reports.iter().map(|r| r.rows_written).sum())
        }
        None => run_or_abort(comm, config).map(|r| r.rows_written),
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn announce(config: &BenchConfig, rows_written: usize) {
    if config.verbose && rows_written > 0 {
        if let Some(path) = &config.output {
            println!("Latencies saved to {}", path.display());
        }
    }
}

#[cfg(not(feature = "mpi"))]
fn execute(args: &Args, config: &BenchConfig) -> i32 {
    use collbench::{Error, LocalGroup};

    let outcomes = match LocalGroup::run(args.np, |world| bench_on(&world, args, config)) {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!(error = %e, "could not start ranks");
            return e.exit_code();
        }
    };

    // Report the error that caused the abort, not the echo on its peers.
    let mut aborted = None;
    for (rank, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok(rows) if rank == 0 => announce(config, *rows),
            Ok(_) => {}
            Err(e @ Error::Aborted(_)) => aborted = aborted.or(Some(e.exit_code())),
            Err(e) => {
                eprintln!("rank {rank}: {e}");
                return e.exit_code();
            }
        }
    }
    aborted.unwrap_or(0)
}

#[cfg(feature = "mpi")]
fn execute(args: &Args, config: &BenchConfig) -> i32 {
    use collbench::Mpi;

    let mpi = match Mpi::init() {
        Ok(mpi) => mpi,
        Err(e) => {
            error!(error = %e, "MPI initialization failed");
            return e.exit_code();
        }
    };
    let world = mpi.world();
    match bench_on(&world, args, config) {
        Ok(rows) => {
            if world.rank() == 0 {
                announce(config, rows);
            }
            0
        }
        Err(e) => {
            eprintln!("rank {}: {e}", world.rank());
            e.exit_code()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config = args.config();
    let code = execute(&args, &config);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
