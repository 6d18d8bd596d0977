//! One benchmark run from plan to record.
//!
//! [`run`] is a collective call: every rank of the group must enter it with
//! the same [`BenchConfig`]. The phases are, in order:
//!
//! 1. plan on the coordinator and broadcast the plan
//! 2. allocate and fill the message buffers
//! 3. time the collective under the shared deadline
//! 4. verify the received payload
//! 5. check trial counts, then reduce statistics
//! 6. persist every rank's samples on the coordinator
//!
//! [`sweep`] repeats a run for a list of message sizes.
//!
//! A final barrier keeps every rank inside the run until the coordinator has
//! finished writing, so a failure there still reaches the whole group.

use std::io::Write;

use tracing::{debug, error, info};

use crate::collective::Workload;
use crate::comm::Communicator;
use crate::config::BenchConfig;
use crate::datatype::{Element, ElementKind};
use crate::error::{Error, Result};
use crate::persist::LatencyPersister;
use crate::plan::{DistributionPlanner, Pattern, SizeSpec};
use crate::report;
use crate::stats::{GlobalSummary, LocalSummary, StatisticsReducer};
use crate::topology::{ProcessTopology, COORDINATOR};
use crate::trial::SynchronizedTrialLoop;

/// Outcome of one run on one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Trials recorded, identical on every rank
    pub trials: u64,
    /// Bytes described by the plan for one invocation
    pub bytes: u64,
    /// This rank's summary
    pub local: LocalSummary,
    /// Group summary, coordinator only
    pub global: Option<GlobalSummary>,
    /// Every rank's summary in rank order, coordinator only and when verbose
    pub ranks: Vec<LocalSummary>,
    /// Rows appended to the record, coordinator only
    pub rows_written: usize,
}

/// Run one benchmark over `comm`.
///
/// Errors are returned as-is; use [`run_or_abort`] to turn them into a
/// coordinated abort of the group.
pub fn run<C: Communicator>(comm: &C, config: &BenchConfig) -> Result<RunReport> {
    run_once(comm, config, config.verbose)
}

/// Like [`run`], but a group-fatal error tears down every rank.
pub fn run_or_abort<C: Communicator>(comm: &C, config: &BenchConfig) -> Result<RunReport> {
    run(comm, config).inspect_err(|e| abort_if_fatal(comm, e))
}

/// Run one benchmark per message size over the same communicator.
///
/// Each entry of `sizes` is spread over the group with `pattern`, replacing
/// `config.sizes`. Runs happen in order and append to the same record, so
/// the header is written at most once. Stops at the first failing size.
///
/// In verbose mode the coordinator prints one global table for the whole
/// sweep instead of one per run.
pub fn sweep<C: Communicator>(
    comm: &C,
    config: &BenchConfig,
    sizes: &[u64],
    pattern: Pattern,
) -> Result<Vec<RunReport>> {
    if sizes.is_empty() {
        return Err(Error::InvalidOption("size sweep has no sizes".into()));
    }
    let reports = sizes
        .iter()
        .map(|&bytes| {
            let config = BenchConfig {
                sizes: SizeSpec::Baseline { bytes, pattern },
                ..config.clone()
            };
            run_once(comm, &config, false)
        })
        .collect::<Result<Vec<_>>>()?;

    if config.verbose && comm.rank() == COORDINATOR {
        let table = report::format_sweep(
            reports
                .iter()
                .filter_map(|r| r.global.as_ref().map(|g| (r.bytes, g))),
        );
        writeln!(std::io::stdout().lock(), "{table}").map_err(|e| Error::io("<stdout>", e))?;
    }
    Ok(reports)
}

/// Like [`sweep`], but a group-fatal error tears down every rank.
pub fn sweep_or_abort<C: Communicator>(
    comm: &C,
    config: &BenchConfig,
    sizes: &[u64],
    pattern: Pattern,
) -> Result<Vec<RunReport>> {
    sweep(comm, config, sizes, pattern).inspect_err(|e| abort_if_fatal(comm, e))
}

fn abort_if_fatal<C: Communicator>(comm: &C, e: &Error) {
    if e.is_group_fatal() {
        error!(rank = comm.rank(), error = %e, "aborting group");
        comm.abort(e.exit_code());
    }
}

fn run_once<C: Communicator>(comm: &C, config: &BenchConfig, print: bool) -> Result<RunReport> {
    match config.element {
        ElementKind::F64 => run_typed::<C, f64>(comm, config, print),
        ElementKind::I32 => run_typed::<C, i32>(comm, config, print),
        ElementKind::U8 => run_typed::<C, u8>(comm, config, print),
    }
}

fn run_typed<C: Communicator, T: Element>(
    comm: &C,
    config: &BenchConfig,
    print: bool,
) -> Result<RunReport> {
    let topology = ProcessTopology::of(comm)?;
    if topology.is_coordinator() {
        info!(
            collective = config.collective.name(),
            element = config.element.name(),
            ranks = topology.size(),
            budget = config.trials.budget,
            "starting run"
        );
    }

    let planner = DistributionPlanner::new(topology, config.sizes.clone(), T::SIZE, config.envelope);
    let plan = planner.distribute(comm)?;
    let bytes = plan.total() * T::SIZE as u64;

    let mut workload = Workload::<T>::prepare(config.collective, &plan, topology, config.envelope)?;
    debug!(
        rank = topology.rank(),
        send = workload.send_len(),
        recv = workload.recv_len(),
        "buffers ready"
    );

    let samples = SynchronizedTrialLoop::new(comm, topology, config.trials)
        .run(|| workload.invoke(comm))?;
    workload.verify()?;
    debug!(rank = topology.rank(), "payload verified");
    drop(workload);

    let reducer = StatisticsReducer::new(comm, topology);
    let trials = reducer.verify_trial_counts(&samples)?;
    let local = LocalSummary::from_samples(&samples)?;
    let global = reducer.reduce(&local)?;
    let ranks = if config.verbose {
        reducer.gather_summaries(&local)?
    } else {
        Vec::new()
    };

    if let Some(global) = &global {
        info!(
            trials,
            mean = global.mean,
            min = global.min,
            max = global.max,
            "run summary"
        );
        if print {
            print_tables(bytes, global, &ranks)?;
        }
    }

    let rows_written = match &config.output {
        Some(path) => LatencyPersister::new(comm, topology, path, config.format).persist(&samples)?,
        None => 0,
    };
    comm.barrier()?;

    Ok(RunReport {
        trials,
        bytes,
        local,
        global,
        ranks,
        rows_written,
    })
}

fn print_tables(bytes: u64, global: &GlobalSummary, ranks: &[LocalSummary]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    let stdout_err = |e| Error::io("<stdout>", e);
    if !ranks.is_empty() {
        writeln!(out, "{}", report::format_rank_table(ranks)).map_err(stdout_err)?;
    }
    writeln!(out, "{}", report::global_header()).map_err(stdout_err)?;
    writeln!(out, "{}", report::format_global(bytes, global)).map_err(stdout_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::Collective;
    use crate::local::LocalGroup;
    use crate::trial::LoopConfig;

    fn config(collective: Collective, element: ElementKind) -> BenchConfig {
        BenchConfig {
            collective,
            sizes: SizeSpec::Baseline {
                bytes: 64,
                pattern: Pattern::Increasing,
            },
            element,
            trials: LoopConfig {
                budget: 60.0,
                warmup: 1,
                max_trials: Some(3),
            },
            output: None,
            ..BenchConfig::default()
        }
    }

    #[test]
    fn every_collective_runs_and_verifies() {
        for collective in Collective::ALL {
            let config = match collective {
                Collective::Allgather => BenchConfig {
                    sizes: SizeSpec::Baseline {
                        bytes: 64,
                        pattern: Pattern::Uniform,
                    },
                    ..config(collective, ElementKind::F64)
                },
                _ => config(collective, ElementKind::F64),
            };
            let out = LocalGroup::run(3, |world| run_or_abort(&world, &config)).unwrap();
            for (rank, report) in out.into_iter().enumerate() {
                let report = report.unwrap_or_else(|e| panic!("{collective} rank {rank}: {e}"));
                assert_eq!(report.trials, 3);
                assert_eq!(report.global.is_some(), rank == 0);
            }
        }
    }

    #[test]
    fn element_kinds_share_one_harness() {
        for element in [ElementKind::I32, ElementKind::U8] {
            let config = config(Collective::Scatterv, element);
            let out = LocalGroup::run(2, |world| run(&world, &config)).unwrap();
            let report = out[0].as_ref().unwrap();
            // 64 and 128 bytes for ranks 0 and 1
            assert_eq!(report.bytes, 192);
        }
    }

    #[test]
    fn group_of_one_is_rejected_before_any_collective() {
        let config = config(Collective::Scatterv, ElementKind::F64);
        let out = LocalGroup::run(1, |world| run_or_abort(&world, &config)).unwrap();
        assert!(matches!(out[0], Err(Error::GroupTooSmall(1))));
    }

    #[test]
    fn sweep_runs_each_size_in_order() {
        let config = config(Collective::Allgatherv, ElementKind::I32);
        let out = LocalGroup::run(2, |world| {
            sweep_or_abort(&world, &config, &[64, 256, 1024], Pattern::Uniform)
        })
        .unwrap();
        let reports = out[0].as_ref().unwrap();
        // uniform over two ranks
        let bytes: Vec<u64> = reports.iter().map(|r| r.bytes).collect();
        assert_eq!(bytes, vec![128, 512, 2048]);
        assert!(reports.iter().all(|r| r.trials == 3 && r.global.is_some()));
        assert!(out[1].as_ref().unwrap().iter().all(|r| r.global.is_none()));
    }

    #[test]
    fn empty_sweep_is_an_invalid_option() {
        let config = config(Collective::Scatterv, ElementKind::F64);
        let out = LocalGroup::run(2, |world| sweep(&world, &config, &[], Pattern::Uniform)).unwrap();
        assert!(out.iter().all(|r| matches!(r, Err(Error::InvalidOption(_)))));
    }

    #[test]
    fn verbose_run_gathers_rank_summaries() {
        let config = BenchConfig {
            verbose: true,
            ..config(Collective::Gatherv, ElementKind::F64)
        };
        let out = LocalGroup::run(4, |world| run(&world, &config)).unwrap();
        assert_eq!(out[0].as_ref().unwrap().ranks.len(), 4);
        assert!(out[3].as_ref().unwrap().ranks.is_empty());
    }
}
