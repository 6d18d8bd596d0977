//! The synchronized trial loop.
//!
//! Every rank times the same number of trials: only the coordinator reads
//! its clock to decide whether to continue, and that decision is broadcast
//! to the whole group after every trial. A barrier separates consecutive
//! trials so that one trial's stragglers never overlap the next.

use tracing::{debug, info};

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::topology::{ProcessTopology, COORDINATOR};

/// Settings of one trial loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopConfig {
    /// Time budget in seconds, measured from the shared deadline reference
    pub budget: f64,
    /// Untimed invocations before the reference is taken
    pub warmup: usize,
    /// Optional cap on the number of recorded trials
    pub max_trials: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        LoopConfig {
            budget: 10.0,
            warmup: 0,
            max_trials: None,
        }
    }
}

/// Start and end of one invocation, in seconds on the substrate's clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialSample {
    /// Timestamp taken right before the invocation
    pub start: f64,
    /// Timestamp taken right after the invocation
    pub end: f64,
}

impl TrialSample {
    /// Duration of the invocation in seconds.
    pub fn latency(&self) -> f64 {
        self.end - self.start
    }
}

/// The samples one rank recorded, in trial order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBuffer {
    samples: Vec<TrialSample>,
}

impl SampleBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one trial.
    pub fn push(&mut self, sample: TrialSample) {
        self.samples.push(sample);
    }

    /// Number of recorded trials.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no trial was recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The recorded samples.
    pub fn samples(&self) -> &[TrialSample] {
        &self.samples
    }

    /// Per-trial latencies in seconds.
    pub fn latencies(&self) -> Vec<f64> {
        self.samples.iter().map(TrialSample::latency).collect()
    }

    /// Start timestamps as one contiguous block.
    pub fn starts(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.start).collect()
    }

    /// End timestamps as one contiguous block.
    pub fn ends(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.end).collect()
    }
}

impl FromIterator<TrialSample> for SampleBuffer {
    fn from_iter<I: IntoIterator<Item = TrialSample>>(iter: I) -> Self {
        SampleBuffer {
            samples: iter.into_iter().collect(),
        }
    }
}

/// Runs an operation under a group-wide deadline.
pub struct SynchronizedTrialLoop<'a, C: Communicator> {
    comm: &'a C,
    topology: ProcessTopology,
    config: LoopConfig,
}

impl<'a, C: Communicator> SynchronizedTrialLoop<'a, C> {
    /// Create a loop over `comm`.
    pub fn new(comm: &'a C, topology: ProcessTopology, config: LoopConfig) -> Self {
        SynchronizedTrialLoop {
            comm,
            topology,
            config,
        }
    }

    /// Time `op` until the coordinator votes to stop.
    ///
    /// The first trial always runs, so a zero budget yields exactly one
    /// sample on every rank. `op` must perform exactly one collective
    /// invocation; it is called the same number of times on every rank.
    pub fn run<F>(&self, mut op: F) -> Result<SampleBuffer>
    where
        F: FnMut() -> Result<()>,
    {
        if self.config.budget.is_nan() || self.config.budget < 0.0 {
            return Err(Error::InvalidOption(format!(
                "time budget must be non-negative, got {}",
                self.config.budget
            )));
        }

        for _ in 0..self.config.warmup {
            op()?;
        }
        if self.config.warmup > 0 {
            debug!(rank = self.topology.rank(), warmup = self.config.warmup, "warm-up done");
        }

        let mut reference = if self.topology.is_coordinator() {
            self.comm.wtime()
        } else {
            0.0
        };
        reference = self.comm.broadcast_scalar(reference, COORDINATOR)?;
        self.comm.barrier()?;

        let mut samples = SampleBuffer::new();
        loop {
            let start = self.comm.wtime();
            op()?;
            let end = self.comm.wtime();
            samples.push(TrialSample { start, end });

            self.comm.barrier()?;

            let mut vote = 1u8;
            if self.topology.is_coordinator() {
                let elapsed = self.comm.wtime() - reference;
                let under_cap = self
                    .config
                    .max_trials
                    .map_or(true, |cap| (samples.len() as u64) < cap);
                vote = u8::from(elapsed < self.config.budget && under_cap);
            }
            vote = self.comm.broadcast_scalar(vote, COORDINATOR)?;
            if vote == 0 {
                break;
            }
        }
        self.comm.barrier()?;

        if self.topology.is_coordinator() {
            info!(
                trials = samples.len(),
                elapsed = self.comm.wtime() - reference,
                "trial loop finished"
            );
        }
        Ok(samples)
    }
}
