//! # collbench
//!
//! Synchronized latency benchmarks for collective data-movement operations.
//!
//! A run plans how many elements every participant moves, times one
//! collective repeatedly under a deadline that the whole group agrees on,
//! reduces the latencies to min/max/average on a coordinator, and appends
//! every raw sample to a CSV record.
//!
//! The harness is generic over the message-passing substrate through the
//! [`Communicator`] trait:
//!
//! - [`LocalGroup`] runs every rank as a thread of the current process
//! - `Mpi` / `MpiComm` (feature `mpi`) run over a system MPI library
//!
//! ## Quick Start
//!
//! ```
//! use collbench::{bench, BenchConfig, Collective, LocalGroup, LoopConfig, Pattern, SizeSpec};
//!
//! let config = BenchConfig {
//!     collective: Collective::Scatterv,
//!     sizes: SizeSpec::Baseline { bytes: 1024, pattern: Pattern::Uniform },
//!     trials: LoopConfig { budget: 1.0, warmup: 0, max_trials: Some(5) },
//!     output: None,
//!     ..BenchConfig::default()
//! };
//! let reports = LocalGroup::run(4, |world| bench::run(&world, &config)).unwrap();
//! let coordinator = reports[0].as_ref().unwrap();
//! assert_eq!(coordinator.trials, 5);
//! assert!(coordinator.global.is_some());
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `mpi`   | MPI substrate through the C shim in `csrc/` | system MPI, `cc`, `pkg-config` |
//!
//! ## Supported Types
//!
//! Payloads are generic over [`Element`]: `f64`, `i32`, `u8`, selected at
//! runtime with [`ElementKind`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod bench;
pub mod collective;
mod comm;
pub mod config;
mod datatype;
pub mod env;
mod error;
mod local;
pub mod persist;
pub mod plan;
pub mod report;
pub mod stats;
mod status;
pub mod topology;
pub mod trial;

#[cfg(feature = "mpi")]
mod ffi;
#[cfg(feature = "mpi")]
mod mpi;

pub use bench::{run_or_abort, sweep_or_abort, RunReport};
pub use collective::{Collective, Workload};
pub use comm::{Communicator, ANY_SOURCE, ANY_TAG};
pub use config::{BenchConfig, EnvOverrides};
pub use datatype::{DatatypeTag, Element, ElementKind};
pub use error::{Error, Result};
pub use local::{LocalComm, LocalGroup};
pub use persist::{LatencyPersister, RecordFormat};
pub use plan::{DistributionPlan, DistributionPlanner, Envelope, Pattern, SizeSpec};
pub use stats::{GlobalSummary, LocalSummary, StatisticsReducer};
pub use status::Status;
pub use topology::{ProcessTopology, COORDINATOR};
pub use trial::{LoopConfig, SampleBuffer, SynchronizedTrialLoop, TrialSample};

#[cfg(feature = "mpi")]
pub use mpi::{Mpi, MpiComm};

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}
