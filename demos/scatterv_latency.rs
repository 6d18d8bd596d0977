//! Scatterv latency sweep over MPI.
//!
//! Times `MPI_Scatterv` for a series of baseline sizes with the increasing
//! pattern (rank `i` receives `(i + 1) * baseline` bytes), prints one table
//! line per size on rank 0 and appends every sample to `scatterv_sweep.csv`.
//!
//! Run with: mpiexec -n 4 cargo run --features mpi --example scatterv_latency

use collbench::{
    bench, report, BenchConfig, Collective, Communicator, LoopConfig, Mpi, Pattern, Result,
    SizeSpec,
};

fn main() -> Result<()> {
    let mpi = Mpi::init()?;

    // Panics must take the whole job down; a lone dead rank would leave the
    // others waiting in the next collective.
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let world = mpi.world();
    let rank = world.rank();

    if rank == 0 {
        println!("{}", report::global_header());
    }

    for baseline in [8u64, 64, 512, 4096, 32768] {
        let config = BenchConfig {
            collective: Collective::Scatterv,
            sizes: SizeSpec::Baseline {
                bytes: baseline,
                pattern: Pattern::Increasing,
            },
            trials: LoopConfig {
                budget: 1.0,
                warmup: 10,
                max_trials: None,
            },
            output: Some("scatterv_sweep.csv".into()),
            ..BenchConfig::default()
        };
        let run = bench::run_or_abort(&world, &config)?;
        if let Some(global) = &run.global {
            println!("{}", report::format_global(run.bytes, global));
        }
    }

    if rank == 0 {
        println!("Latencies saved to scatterv_sweep.csv");
    }
    Ok(())
}
