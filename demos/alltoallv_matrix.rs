//! Personalized all-to-all driven by a per-peer matrix.
//!
//! Rank 0 writes a matrix where rank `i` sends `(i + j + 1) * 16` elements
//! to rank `j`, then the whole group times `MPI_Alltoallv` for two seconds
//! and prints the per-rank table and bandwidth.
//!
//! Run with: mpiexec -n 4 cargo run --features mpi --example alltoallv_matrix

use std::fs;

use collbench::{
    bench, report, BenchConfig, Collective, Communicator, Error, LoopConfig, Mpi, Result, SizeSpec,
};

const MATRIX: &str = "alltoallv_matrix.txt";

fn main() -> Result<()> {
    let mpi = Mpi::init()?;

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let world = mpi.world();
    let rank = world.rank();
    let size = world.size() as usize;

    // Only the coordinator reads the matrix, so only it needs to write one.
    if rank == 0 {
        let rows: Vec<String> = (0..size)
            .map(|i| {
                (0..size)
                    .map(|j| ((i + j + 1) * 16).to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect();
        fs::write(MATRIX, rows.join("\n")).map_err(|e| Error::io(MATRIX, e))?;
    }

    let config = BenchConfig {
        collective: Collective::Alltoallv,
        sizes: SizeSpec::Matrix(MATRIX.into()),
        trials: LoopConfig {
            budget: 2.0,
            warmup: 5,
            max_trials: None,
        },
        output: None,
        verbose: true,
        ..BenchConfig::default()
    };

    // Verbose runs print the per-rank and global tables on rank 0.
    let run = bench::run_or_abort(&world, &config)?;
    if let Some(global) = &run.global {
        println!(
            "{} trials, {:.3} MB/s",
            run.trials,
            report::bandwidth(run.bytes, global.mean)
        );
    }
    Ok(())
}
