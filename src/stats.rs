//! Latency statistics, local and group-wide.
//!
//! All values are seconds. Conversion to microseconds happens only in
//! [`report`](crate::report).

use tracing::debug;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::topology::{ProcessTopology, COORDINATOR};
use crate::trial::SampleBuffer;
use crate::ReduceOp;

/// Summary of one rank's latencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSummary {
    /// Number of trials summarized
    pub trials: u64,
    /// Smallest latency
    pub min: f64,
    /// Largest latency
    pub max: f64,
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub stddev: f64,
}

impl LocalSummary {
    /// Summarize a list of latencies.
    pub fn from_latencies(latencies: &[f64]) -> Result<Self> {
        if latencies.is_empty() {
            return Err(Error::NoSamples);
        }
        let n = latencies.len() as f64;
        let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = latencies.iter().sum::<f64>() / n;
        let variance = latencies.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
        Ok(LocalSummary {
            trials: latencies.len() as u64,
            min,
            max,
            mean,
            stddev: variance.sqrt(),
        })
    }

    /// Summarize a sample buffer.
    pub fn from_samples(samples: &SampleBuffer) -> Result<Self> {
        Self::from_latencies(&samples.latencies())
    }
}

/// Group-wide latency summary, meaningful on the coordinator only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalSummary {
    /// Trials per rank
    pub trials: u64,
    /// Number of ranks reduced
    pub ranks: usize,
    /// Minimum over all ranks' minimums
    pub min: f64,
    /// Maximum over all ranks' maximums
    pub max: f64,
    /// Average of the ranks' means
    ///
    /// Not the mean of all pooled samples: equal trial counts make the two
    /// agree, and only three values per rank cross the network.
    pub mean: f64,
}

/// Reduces per-rank summaries onto the coordinator.
pub struct StatisticsReducer<'a, C: Communicator> {
    comm: &'a C,
    topology: ProcessTopology,
}

impl<'a, C: Communicator> StatisticsReducer<'a, C> {
    /// Create a reducer over `comm`.
    pub fn new(comm: &'a C, topology: ProcessTopology) -> Self {
        StatisticsReducer { comm, topology }
    }

    /// Confirm every rank recorded the same number of trials.
    ///
    /// Returns the common count on every rank. A mismatch is reported on the
    /// coordinator; the other ranks learn about it through the group abort.
    pub fn verify_trial_counts(&self, samples: &SampleBuffer) -> Result<u64> {
        let local = samples.len() as u64;
        let counts = self.comm.gather_scalar(local, COORDINATOR)?;
        if self.topology.is_coordinator() {
            check_counts(&counts)?;
            debug!(trials = local, ranks = counts.len(), "trial counts agree");
        }
        Ok(local)
    }

    /// Reduce local summaries to a global one.
    ///
    /// Returns `Some` on the coordinator and `None` elsewhere.
    pub fn reduce(&self, local: &LocalSummary) -> Result<Option<GlobalSummary>> {
        let min = self.comm.reduce_scalar(local.min, ReduceOp::Min, COORDINATOR)?;
        let max = self.comm.reduce_scalar(local.max, ReduceOp::Max, COORDINATOR)?;
        let sum = self.comm.reduce_scalar(local.mean, ReduceOp::Sum, COORDINATOR)?;
        if !self.topology.is_coordinator() {
            return Ok(None);
        }
        Ok(Some(GlobalSummary {
            trials: local.trials,
            ranks: self.topology.group_len(),
            min,
            max,
            mean: sum / f64::from(self.topology.size()),
        }))
    }

    /// Collect every rank's summary on the coordinator, in rank order.
    ///
    /// Only `(mean, min, max, stddev)` travels per rank. Returns an empty
    /// vector on every other rank.
    pub fn gather_summaries(&self, local: &LocalSummary) -> Result<Vec<LocalSummary>> {
        let send = [local.mean, local.min, local.max, local.stddev];
        let n = self.topology.group_len();
        let mut recv = if self.topology.is_coordinator() {
            vec![0.0; 4 * n]
        } else {
            Vec::new()
        };
        self.comm.gather(&send, &mut recv, COORDINATOR)?;
        Ok(recv
            .chunks_exact(4)
            .map(|c| LocalSummary {
                trials: local.trials,
                mean: c[0],
                min: c[1],
                max: c[2],
                stddev: c[3],
            })
            .collect())
    }
}

/// Check that all gathered trial counts agree with the coordinator's.
pub fn check_counts(counts: &[u64]) -> Result<()> {
    let Some(&expected) = counts.first() else {
        return Ok(());
    };
    match counts.iter().position(|&c| c != expected) {
        Some(rank) => Err(Error::CountMismatch {
            rank,
            found: counts[rank],
            expected,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalGroup;
    use crate::trial::TrialSample;
    use proptest::prelude::*;

    fn buffer(latencies: &[f64]) -> SampleBuffer {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &l)| TrialSample {
                start: i as f64,
                end: i as f64 + l,
            })
            .collect()
    }

    #[test]
    fn local_summary_of_known_values() {
        let s = LocalSummary::from_latencies(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(s.trials, 4);
        assert_eq!((s.min, s.max, s.mean), (1.0, 4.0, 2.5));
        assert!((s.stddev - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn empty_buffer_has_no_summary() {
        assert!(matches!(
            LocalSummary::from_samples(&SampleBuffer::new()),
            Err(Error::NoSamples)
        ));
    }

    #[test]
    fn global_mean_is_average_of_means() {
        let out = LocalGroup::run(4, |world| {
            let topology = ProcessTopology::of(&world)?;
            let r = world.rank() as f64;
            // rank r: latencies r+1 and r+3, mean r+2
            let local = LocalSummary::from_samples(&buffer(&[r + 1.0, r + 3.0]))?;
            StatisticsReducer::new(&world, topology).reduce(&local)
        })
        .unwrap();
        let global = out[0].as_ref().unwrap().unwrap();
        assert_eq!(global.min, 1.0);
        assert_eq!(global.max, 6.0);
        assert_eq!(global.mean, 3.5);
        assert_eq!(global.ranks, 4);
        assert!(out[1..].iter().all(|o| matches!(o, Ok(None))));
    }

    #[test]
    fn mismatched_counts_abort_on_the_coordinator() {
        assert!(check_counts(&[5, 5, 5]).is_ok());
        assert!(matches!(
            check_counts(&[5, 5, 4, 5]),
            Err(Error::CountMismatch {
                rank: 2,
                found: 4,
                expected: 5
            })
        ));

        let out = LocalGroup::run(3, |world| {
            let topology = ProcessTopology::of(&world)?;
            let n = if world.rank() == 1 { 2 } else { 3 };
            let samples = buffer(&vec![0.5; n]);
            let reducer = StatisticsReducer::new(&world, topology);
            reducer.verify_trial_counts(&samples)?;
            world.barrier()
        })
        .unwrap();
        assert!(matches!(out[0], Err(Error::CountMismatch { rank: 1, .. })));
        assert!(matches!(out[1], Err(Error::Aborted(_))));
        assert!(matches!(out[2], Err(Error::Aborted(_))));
    }

    #[test]
    fn summaries_arrive_in_rank_order() {
        let out = LocalGroup::run(3, |world| {
            let topology = ProcessTopology::of(&world)?;
            let r = world.rank() as f64;
            let local = LocalSummary::from_samples(&buffer(&[r, r]))?;
            StatisticsReducer::new(&world, topology).gather_summaries(&local)
        })
        .unwrap();
        let table = out[0].as_ref().unwrap();
        let means: Vec<f64> = table.iter().map(|s| s.mean).collect();
        assert_eq!(means, vec![0.0, 1.0, 2.0]);
        assert!(out[2].as_ref().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn summary_bounds_hold(latencies in proptest::collection::vec(0.0f64..1.0, 1..200)) {
            let s = LocalSummary::from_latencies(&latencies).unwrap();
            prop_assert!(s.min <= s.mean + 1e-12);
            prop_assert!(s.mean <= s.max + 1e-12);
            prop_assert!(s.stddev >= 0.0);
            prop_assert_eq!(s.trials as usize, latencies.len());
        }
    }
}
