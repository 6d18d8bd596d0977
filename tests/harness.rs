//! End-to-end runs on the in-process substrate.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use collbench::bench::sweep_or_abort;
use collbench::persist::{read_latency_records, read_start_end_records};
use collbench::{
    bench, report, run_or_abort, BenchConfig, Collective, Communicator, ElementKind, Error, LocalGroup,
    LoopConfig, Pattern, RecordFormat, SizeSpec,
};
use tempfile::TempDir;

fn fixed_trials(trials: u64) -> LoopConfig {
    LoopConfig {
        budget: 3600.0,
        warmup: 0,
        max_trials: Some(trials),
    }
}

#[test]
fn four_ranks_ten_trials_give_forty_rows() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("latencies.csv");
    let config = BenchConfig {
        collective: Collective::Scatterv,
        sizes: SizeSpec::Baseline {
            bytes: 1024 * 8,
            pattern: Pattern::Uniform,
        },
        trials: fixed_trials(10),
        output: Some(output.clone()),
        ..BenchConfig::default()
    };

    let outcomes = LocalGroup::run(4, |world| run_or_abort(&world, &config)).unwrap();
    for outcome in &outcomes {
        assert_eq!(outcome.as_ref().unwrap().trials, 10);
    }
    assert_eq!(outcomes[0].as_ref().unwrap().rows_written, 40);

    let records = read_latency_records(&output).unwrap();
    assert_eq!(records.len(), 40);
    for rank in 0..4 {
        let iterations: Vec<usize> = records
            .iter()
            .filter(|r| r.rank == rank)
            .map(|r| r.iteration)
            .collect();
        assert_eq!(iterations, (0..10).collect::<Vec<_>>());
    }
    assert!(records.iter().all(|r| r.latency >= 0.0));
}

#[test]
fn short_matrix_aborts_before_any_trial() {
    let dir = TempDir::new().unwrap();
    let matrix = dir.path().join("matrix.txt");
    fs::write(&matrix, "1,2,3,4\n4,3,2,1\n1,1,1,1\n").unwrap();
    let output = dir.path().join("never.csv");
    let config = BenchConfig {
        collective: Collective::Alltoallv,
        sizes: SizeSpec::Matrix(matrix),
        trials: fixed_trials(5),
        output: Some(output.clone()),
        ..BenchConfig::default()
    };

    let outcomes = LocalGroup::run(4, |world| run_or_abort(&world, &config)).unwrap();
    let code = match &outcomes[0] {
        Err(e @ Error::Config { .. }) => e.exit_code(),
        other => panic!("coordinator should fail on the matrix, got {other:?}"),
    };
    for outcome in &outcomes[1..] {
        assert!(matches!(outcome, Err(Error::Aborted(c)) if *c == code));
    }
    assert!(!output.exists());
}

#[test]
fn width_mismatch_is_a_configuration_error() {
    let dir = TempDir::new().unwrap();
    let row = dir.path().join("row.txt");
    fs::write(&row, "8,8,8\n").unwrap();
    let config = BenchConfig {
        sizes: SizeSpec::Row(row),
        trials: fixed_trials(1),
        output: None,
        ..BenchConfig::default()
    };
    let outcomes = LocalGroup::run(4, |world| run_or_abort(&world, &config)).unwrap();
    assert!(matches!(
        outcomes[0],
        Err(Error::WidthMismatch {
            columns: 3,
            size: 4,
            ..
        })
    ));
}

#[test]
fn stalled_peer_blocks_the_barrier_until_abort() {
    let group = LocalGroup::new(3).unwrap();
    let comms = group.communicators();
    let released = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = comms
        .into_iter()
        .take(2)
        .map(|comm| {
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let outcome = comm.barrier();
                released.store(true, Ordering::SeqCst);
                outcome
            })
        })
        .collect();

    // Rank 2 never arrives.
    thread::sleep(Duration::from_millis(200));
    assert!(!released.load(Ordering::SeqCst));

    group.abort(7);
    for handle in handles {
        assert!(matches!(handle.join().unwrap(), Err(Error::Aborted(7))));
    }
}

#[test]
fn zero_budget_runs_one_trial_everywhere() {
    let config = BenchConfig {
        collective: Collective::Allgatherv,
        sizes: SizeSpec::Baseline {
            bytes: 256,
            pattern: Pattern::Increasing,
        },
        trials: LoopConfig {
            budget: 0.0,
            warmup: 2,
            max_trials: None,
        },
        output: None,
        ..BenchConfig::default()
    };
    let outcomes = LocalGroup::run(4, |world| bench::run(&world, &config)).unwrap();
    for outcome in outcomes {
        assert_eq!(outcome.unwrap().trials, 1);
    }
}

#[test]
fn single_participant_is_rejected() {
    let config = BenchConfig {
        output: None,
        ..BenchConfig::default()
    };
    let outcomes = LocalGroup::run(1, |world| run_or_abort(&world, &config)).unwrap();
    assert!(matches!(outcomes[0], Err(Error::GroupTooSmall(1))));
}

#[test]
fn repeated_runs_append_under_one_header() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("runs.csv");
    let config = BenchConfig {
        collective: Collective::Gatherv,
        sizes: SizeSpec::Baseline {
            bytes: 64,
            pattern: Pattern::Uniform,
        },
        trials: fixed_trials(3),
        output: Some(output.clone()),
        ..BenchConfig::default()
    };
    for _ in 0..2 {
        let outcomes = LocalGroup::run(2, |world| run_or_abort(&world, &config)).unwrap();
        assert!(outcomes.iter().all(Result::is_ok));
    }
    let text = fs::read_to_string(&output).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("Rank,")).count(), 1);
    assert_eq!(read_latency_records(&output).unwrap().len(), 12);
}

#[test]
fn start_end_records_cover_every_rank() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("timestamps.csv");
    let config = BenchConfig {
        collective: Collective::Broadcast,
        sizes: SizeSpec::Baseline {
            bytes: 512,
            pattern: Pattern::Uniform,
        },
        element: ElementKind::U8,
        trials: fixed_trials(4),
        output: Some(output.clone()),
        format: RecordFormat::StartEnd,
        ..BenchConfig::default()
    };
    let outcomes = LocalGroup::run(3, |world| run_or_abort(&world, &config)).unwrap();
    assert!(outcomes.iter().all(Result::is_ok));

    let records = read_start_end_records(&output).unwrap();
    assert_eq!(records.len(), 12);
    assert!(records.iter().all(|r| r.end >= r.start));
}

#[test]
fn oversized_plan_is_rejected_by_the_envelope() {
    let config = BenchConfig {
        sizes: SizeSpec::Baseline {
            bytes: 1 << 20,
            pattern: Pattern::Uniform,
        },
        envelope: collbench::Envelope {
            min_bytes: 0,
            max_bytes: 1 << 16,
        },
        trials: fixed_trials(1),
        output: None,
        ..BenchConfig::default()
    };
    let outcomes = LocalGroup::run(2, |world| run_or_abort(&world, &config)).unwrap();
    assert!(matches!(outcomes[0], Err(Error::Envelope { .. })));
    assert!(matches!(outcomes[1], Err(Error::Aborted(3))));
}

#[test]
fn alltoallv_matrix_run_succeeds() {
    let dir = TempDir::new().unwrap();
    let matrix = dir.path().join("matrix.txt");
    fs::write(&matrix, "0,1,2\n3,0,4\n5,6,0\n").unwrap();
    let config = BenchConfig {
        collective: Collective::Alltoallv,
        sizes: SizeSpec::Matrix(matrix),
        element: ElementKind::I32,
        trials: fixed_trials(2),
        output: None,
        ..BenchConfig::default()
    };
    let outcomes = LocalGroup::run(3, |world| run_or_abort(&world, &config)).unwrap();
    let report = outcomes[0].as_ref().unwrap();
    assert_eq!(report.bytes, 21 * 4);
}

#[test]
fn three_size_sweep_appends_every_run_under_one_header() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("sweep.csv");
    let config = BenchConfig {
        collective: Collective::Scatterv,
        trials: fixed_trials(5),
        output: Some(output.clone()),
        ..BenchConfig::default()
    };
    let sizes = [1024, 4096, 16384];

    let outcomes = LocalGroup::run(4, |world| {
        sweep_or_abort(&world, &config, &sizes, Pattern::Increasing)
    })
    .unwrap();
    let reports = outcomes[0].as_ref().unwrap();
    assert_eq!(reports.len(), 3);
    assert_eq!(
        reports.iter().map(|r| r.rows_written).sum::<usize>(),
        3 * 4 * 5
    );

    let table = report::format_sweep(
        reports
            .iter()
            .map(|r| (r.bytes, r.global.as_ref().unwrap())),
    );
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines.len(), 1 + 3);
    // increasing over four ranks moves 1 + 2 + 3 + 4 = 10 baselines
    for (line, size) in lines[1..].iter().zip(sizes) {
        assert!(line.starts_with(&(10 * size).to_string()));
    }

    let text = fs::read_to_string(&output).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("Rank,")).count(), 1);
    assert_eq!(read_latency_records(&output).unwrap().len(), 3 * 4 * 5);
}
