//! Distribution planning: who sends how many elements to whom.
//!
//! The coordinator turns a [`SizeSpec`] into a [`DistributionPlan`] and
//! broadcasts it verbatim; every other rank only ever receives the plan.
//! Nobody but the coordinator opens the messages source, so there is no way
//! for two ranks to parse it differently.
//!
//! # Messages source
//!
//! One line of comma-separated, non-negative integers with one column per
//! process (`4,8,15,16`), or, for [`SizeSpec::Matrix`], one such line per
//! process, where row `i` lists what rank `i` sends to each peer.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::topology::{ProcessTopology, COORDINATOR};

/// Default upper bound on a single message buffer (1 GiB).
pub const DEFAULT_MAX_BYTES: u64 = 1 << 30;

/// How counts grow across participants for a baseline size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pattern {
    /// Every participant gets `baseline / element_size` elements
    #[default]
    Uniform,
    /// Participant `i` gets `baseline * (i + 1) / element_size` elements
    Increasing,
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" | "equal" => Ok(Pattern::Uniform),
            "increasing" => Ok(Pattern::Increasing),
            other => Err(Error::InvalidOption(format!("unknown pattern '{other}'"))),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Uniform => f.write_str("uniform"),
            Pattern::Increasing => f.write_str("increasing"),
        }
    }
}

/// Where the per-process message sizes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeSpec {
    /// A baseline size in bytes spread according to a pattern
    Baseline {
        /// Baseline message size in bytes
        bytes: u64,
        /// How the baseline grows with the participant index
        pattern: Pattern,
    },
    /// A single row of per-process element counts read from a file
    Row(PathBuf),
    /// One row per process of per-peer element counts read from a file
    Matrix(PathBuf),
}

/// Bounds on the size of one message buffer.
///
/// Checked before anything is allocated so an oversized request fails fast
/// instead of exhausting memory halfway through a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Smallest allowed buffer in bytes
    pub min_bytes: u64,
    /// Largest allowed buffer in bytes
    pub max_bytes: u64,
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope {
            min_bytes: 0,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl Envelope {
    /// Check a buffer size against the envelope.
    ///
    /// An empty buffer is always within the lower bound: ranks that move no
    /// data in a plan are legitimate.
    pub fn check(&self, bytes: u64) -> Result<()> {
        if (bytes > 0 && bytes < self.min_bytes) || bytes > self.max_bytes {
            return Err(Error::Envelope {
                bytes,
                min: self.min_bytes,
                max: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Element counts and offsets for every participant.
///
/// `offsets[0] == 0` and `offsets[i] == offsets[i - 1] + counts[i - 1]`.
/// For a matrix plan, `counts[i]` is the total rank `i` sends and the
/// per-peer breakdown is available through [`send_counts`](Self::send_counts)
/// and [`recv_counts`](Self::recv_counts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPlan {
    counts: Vec<i32>,
    offsets: Vec<i32>,
    /// Row-major `size x size` per-peer counts, if planned from a matrix
    peers: Option<Vec<i32>>,
}

impl DistributionPlan {
    /// Build a plan from per-participant counts.
    pub fn from_counts(counts: Vec<i32>) -> Result<Self> {
        let offsets = prefix_offsets(&counts)?;
        Ok(DistributionPlan {
            counts,
            offsets,
            peers: None,
        })
    }

    /// Build a plan from a square per-peer matrix (row `i` = what rank `i` sends).
    pub fn from_matrix(rows: Vec<Vec<i32>>) -> Result<Self> {
        let size = rows.len();
        let mut peers = Vec::with_capacity(size * size);
        let mut counts = Vec::with_capacity(size);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != size {
                return Err(Error::WidthMismatch {
                    row: i,
                    columns: row.len(),
                    size: size as i32,
                });
            }
            let total: i64 = row.iter().map(|&c| i64::from(c)).sum();
            counts.push(i32::try_from(total).map_err(|_| Error::InvalidCount(total))?);
            peers.extend(row);
        }
        let offsets = prefix_offsets(&counts)?;
        Ok(DistributionPlan {
            counts,
            offsets,
            peers: Some(peers),
        })
    }

    /// Element count of every participant.
    pub fn counts(&self) -> &[i32] {
        &self.counts
    }

    /// Offset of every participant's block.
    pub fn offsets(&self) -> &[i32] {
        &self.offsets
    }

    /// Number of participants the plan covers.
    pub fn participants(&self) -> usize {
        self.counts.len()
    }

    /// Total number of elements across all participants.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Whether the plan carries a per-peer matrix.
    pub fn has_peer_matrix(&self) -> bool {
        self.peers.is_some()
    }

    /// Whether every participant has the same count.
    pub fn is_uniform(&self) -> bool {
        self.counts.windows(2).all(|w| w[0] == w[1])
    }

    /// Counts `rank` sends to each peer.
    ///
    /// Without a matrix, every rank sends `counts[j]` elements to rank `j`.
    pub fn send_counts(&self, rank: usize) -> Vec<i32> {
        let n = self.participants();
        match &self.peers {
            Some(cells) => cells[rank * n..(rank + 1) * n].to_vec(),
            None => self.counts.clone(),
        }
    }

    /// Counts `rank` receives from each peer.
    pub fn recv_counts(&self, rank: usize) -> Vec<i32> {
        let n = self.participants();
        match &self.peers {
            Some(cells) => (0..n).map(|i| cells[i * n + rank]).collect(),
            None => vec![self.counts[rank]; n],
        }
    }

    /// Broadcast the plan from the coordinator.
    ///
    /// The coordinator passes `Some(plan)`, every other rank `None`; all ranks
    /// return an identical copy.
    pub fn share<C: Communicator>(
        comm: &C,
        topology: ProcessTopology,
        plan: Option<DistributionPlan>,
    ) -> Result<DistributionPlan> {
        let n = topology.group_len();
        let (mut counts, mut offsets, mut has_peers, mut peers) = match plan {
            Some(p) if topology.is_coordinator() => {
                if p.participants() != n {
                    return Err(Error::WidthMismatch {
                        row: 0,
                        columns: p.participants(),
                        size: topology.size(),
                    });
                }
                let has = i32::from(p.peers.is_some());
                let peers = p.peers.unwrap_or_default();
                (p.counts, p.offsets, has, peers)
            }
            _ => (vec![0; n], vec![0; n], 0, Vec::new()),
        };

        comm.broadcast(&mut counts, COORDINATOR)?;
        comm.broadcast(&mut offsets, COORDINATOR)?;
        has_peers = comm.broadcast_scalar(has_peers, COORDINATOR)?;
        if has_peers != 0 {
            peers.resize(n * n, 0);
            comm.broadcast(&mut peers, COORDINATOR)?;
        }

        Ok(DistributionPlan {
            counts,
            offsets,
            peers: (has_peers != 0).then_some(peers),
        })
    }
}

/// Exclusive prefix sums of `counts`.
pub fn prefix_offsets(counts: &[i32]) -> Result<Vec<i32>> {
    let mut offsets = Vec::with_capacity(counts.len());
    let mut acc: i32 = 0;
    for &c in counts {
        if c < 0 {
            return Err(Error::InvalidCount(i64::from(c)));
        }
        offsets.push(acc);
        acc = acc
            .checked_add(c)
            .ok_or(Error::InvalidCount(i64::from(acc) + i64::from(c)))?;
    }
    Ok(offsets)
}

/// Builds the plan for one benchmark run.
#[derive(Debug, Clone)]
pub struct DistributionPlanner {
    topology: ProcessTopology,
    spec: SizeSpec,
    element_size: usize,
    envelope: Envelope,
}

impl DistributionPlanner {
    /// Create a planner for elements of `element_size` bytes.
    pub fn new(
        topology: ProcessTopology,
        spec: SizeSpec,
        element_size: usize,
        envelope: Envelope,
    ) -> Self {
        DistributionPlanner {
            topology,
            spec,
            element_size: element_size.max(1),
            envelope,
        }
    }

    /// Compute the plan from the size specification.
    ///
    /// Reads the messages source if there is one; meant for the coordinator.
    pub fn plan(&self) -> Result<DistributionPlan> {
        let n = self.topology.group_len();
        let plan = match &self.spec {
            SizeSpec::Baseline { bytes, pattern } => {
                let counts = (0..n)
                    .map(|i| {
                        let scaled = match pattern {
                            Pattern::Uniform => *bytes,
                            Pattern::Increasing => bytes * (i as u64 + 1),
                        };
                        let count = scaled / self.element_size as u64;
                        i32::try_from(count).map_err(|_| Error::InvalidCount(count as i64))
                    })
                    .collect::<Result<Vec<_>>>()?;
                DistributionPlan::from_counts(counts)?
            }
            SizeSpec::Row(path) => {
                let rows = read_rows(path, 1)?;
                let row = rows.into_iter().next().unwrap_or_default();
                check_width(0, &row, self.topology.size())?;
                DistributionPlan::from_counts(row)?
            }
            SizeSpec::Matrix(path) => {
                let rows = read_rows(path, n)?;
                for (i, row) in rows.iter().enumerate() {
                    check_width(i, row, self.topology.size())?;
                }
                DistributionPlan::from_matrix(rows)?
            }
        };

        let bytes = plan.total() * self.element_size as u64;
        self.envelope.check(bytes)?;
        debug!(
            participants = plan.participants(),
            total = plan.total(),
            bytes,
            "planned distribution"
        );
        Ok(plan)
    }

    /// Plan on the coordinator and broadcast the result to every rank.
    ///
    /// If planning fails on the coordinator the error is returned there and
    /// the other ranks stay blocked in the broadcast until the group aborts.
    pub fn distribute<C: Communicator>(&self, comm: &C) -> Result<DistributionPlan> {
        let local = if self.topology.is_coordinator() {
            Some(self.plan()?)
        } else {
            None
        };
        DistributionPlan::share(comm, self.topology, local)
    }
}

fn check_width(row: usize, values: &[i32], size: i32) -> Result<()> {
    if values.len() != size as usize {
        return Err(Error::WidthMismatch {
            row,
            columns: values.len(),
            size,
        });
    }
    Ok(())
}

/// Read exactly `expected` non-blank rows of counts from `path`.
fn read_rows(path: &Path, expected: usize) -> Result<Vec<Vec<i32>>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::config(path, format!("could not open file: {e}")))?;
    let rows = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| parse_row(line).map_err(|reason| Error::config(path, format!("row {i}: {reason}"))))
        .collect::<Result<Vec<_>>>()?;

    if rows.is_empty() {
        return Err(Error::config(path, "could not read line"));
    }
    if expected > 1 && rows.len() != expected {
        return Err(Error::config(
            path,
            format!(
                "matrix has {} rows but there are {expected} processes",
                rows.len()
            ),
        ));
    }
    Ok(rows.into_iter().take(expected).collect())
}

/// Message sizes doubling from `min` up to and including `max`.
///
/// Empty when `min` is zero or larger than `max`.
pub fn doubling_sizes(min: u64, max: u64) -> Vec<u64> {
    if min == 0 {
        return Vec::new();
    }
    std::iter::successors(Some(min), |&s| s.checked_mul(2))
        .take_while(|&s| s <= max)
        .collect()
}

/// Parse one line of comma-separated non-negative counts.
///
/// One trailing comma is tolerated (`1,2,3,` has three columns).
pub fn parse_row(line: &str) -> std::result::Result<Vec<i32>, String> {
    let line = line.trim_end();
    let line = line.strip_suffix(',').unwrap_or(line);
    line.split(',')
        .map(str::trim)
        .map(|field| {
            let value: i64 = field
                .parse()
                .map_err(|_| format!("'{field}' is not an integer"))?;
            if value < 0 {
                return Err(format!("negative count {value}"));
            }
            i32::try_from(value).map_err(|_| format!("count {value} is too large"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalGroup;
    use proptest::prelude::*;
    use std::io::Write;

    fn topo(size: i32) -> ProcessTopology {
        ProcessTopology::new(0, size).unwrap()
    }

    fn planner(size: i32, spec: SizeSpec) -> DistributionPlanner {
        DistributionPlanner::new(topo(size), spec, 8, Envelope::default())
    }

    fn messages_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn uniform_counts_divide_by_element_size() {
        let plan = planner(
            4,
            SizeSpec::Baseline {
                bytes: 1024,
                pattern: Pattern::Uniform,
            },
        )
        .plan()
        .unwrap();
        assert_eq!(plan.counts(), &[128, 128, 128, 128]);
        assert_eq!(plan.offsets(), &[0, 128, 256, 384]);
        assert!(plan.is_uniform());
    }

    #[test]
    fn increasing_counts_scale_with_index() {
        let plan = planner(
            3,
            SizeSpec::Baseline {
                bytes: 64,
                pattern: Pattern::Increasing,
            },
        )
        .plan()
        .unwrap();
        assert_eq!(plan.counts(), &[8, 16, 24]);
        assert_eq!(plan.offsets(), &[0, 8, 24]);
        assert_eq!(plan.total(), 48);
    }

    #[test]
    fn row_source_is_parsed() {
        let f = messages_file("4, 8,15,16\n");
        let plan = planner(4, SizeSpec::Row(f.path().to_path_buf()))
            .plan()
            .unwrap();
        assert_eq!(plan.counts(), &[4, 8, 15, 16]);
        assert_eq!(plan.offsets(), &[0, 4, 12, 27]);
    }

    #[test]
    fn row_width_must_match_group() {
        let f = messages_file("1,2,3\n");
        let err = planner(4, SizeSpec::Row(f.path().to_path_buf()))
            .plan()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::WidthMismatch {
                columns: 3,
                size: 4,
                ..
            }
        ));
    }

    #[test]
    fn matrix_needs_one_row_per_process() {
        let f = messages_file("1,2,3,4\n1,2,3,4\n1,2,3,4\n");
        let err = planner(4, SizeSpec::Matrix(f.path().to_path_buf()))
            .plan()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn matrix_send_and_recv_counts() {
        let f = messages_file("0,1,2\n3,4,5\n6,7,8\n");
        let plan = planner(3, SizeSpec::Matrix(f.path().to_path_buf()))
            .plan()
            .unwrap();
        assert_eq!(plan.counts(), &[3, 12, 21]);
        assert_eq!(plan.send_counts(1), vec![3, 4, 5]);
        assert_eq!(plan.recv_counts(1), vec![1, 4, 7]);
    }

    #[test]
    fn malformed_and_missing_sources_are_config_errors() {
        let f = messages_file("1,two,3\n");
        assert!(matches!(
            planner(3, SizeSpec::Row(f.path().to_path_buf())).plan(),
            Err(Error::Config { .. })
        ));
        let empty = messages_file("\n\n");
        assert!(matches!(
            planner(3, SizeSpec::Row(empty.path().to_path_buf())).plan(),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            planner(3, SizeSpec::Row("/nonexistent/messages.csv".into())).plan(),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn envelope_rejects_oversized_plans() {
        let p = DistributionPlanner::new(
            topo(2),
            SizeSpec::Baseline {
                bytes: 4096,
                pattern: Pattern::Uniform,
            },
            8,
            Envelope {
                min_bytes: 0,
                max_bytes: 4096,
            },
        );
        assert!(matches!(
            p.plan(),
            Err(Error::Envelope { bytes: 8192, .. })
        ));
    }

    #[test]
    fn one_trailing_comma_is_tolerated() {
        assert_eq!(parse_row("1,2,3,4,"), Ok(vec![1, 2, 3, 4]));
        assert_eq!(parse_row("1, 2 ,\r"), Ok(vec![1, 2]));
        assert!(parse_row("1,2,,").is_err());

        let f = messages_file("8,16,24,\n");
        let plan = planner(3, SizeSpec::Row(f.path().to_path_buf())).plan().unwrap();
        assert_eq!(plan.counts(), &[8, 16, 24]);
    }

    #[test]
    fn empty_buffers_pass_the_lower_bound() {
        let envelope = Envelope {
            min_bytes: 64,
            max_bytes: 4096,
        };
        assert!(envelope.check(0).is_ok());
        assert!(envelope.check(64).is_ok());
        assert!(matches!(envelope.check(8), Err(Error::Envelope { bytes: 8, .. })));
    }

    #[test]
    fn doubling_sizes_stop_at_the_maximum() {
        assert_eq!(doubling_sizes(1024, 8192), vec![1024, 2048, 4096, 8192]);
        assert_eq!(doubling_sizes(1000, 5000), vec![1000, 2000, 4000]);
        assert!(doubling_sizes(0, 8192).is_empty());
        assert!(doubling_sizes(4096, 1024).is_empty());
        assert_eq!(doubling_sizes(u64::MAX / 2 + 1, u64::MAX).len(), 1);
    }

    #[test]
    fn negative_counts_are_rejected() {
        assert!(parse_row("1,-2").is_err());
        assert!(prefix_offsets(&[1, -2]).is_err());
    }

    #[test]
    fn shared_plan_is_identical_everywhere() {
        let f = messages_file("0,1,2\n3,4,5\n6,7,8\n");
        let path = f.path().to_path_buf();
        let out = LocalGroup::run(3, |world| {
            let topology = ProcessTopology::of(&world)?;
            DistributionPlanner::new(topology, SizeSpec::Matrix(path.clone()), 8, Envelope::default())
                .distribute(&world)
        })
        .unwrap();
        let plans: Vec<DistributionPlan> = out.into_iter().map(|p| p.unwrap()).collect();
        assert!(plans.windows(2).all(|w| w[0] == w[1]));
        assert!(plans[2].has_peer_matrix());
    }

    proptest! {
        #[test]
        fn offsets_are_prefix_sums(counts in proptest::collection::vec(0i32..10_000, 2..64)) {
            let plan = DistributionPlan::from_counts(counts.clone()).unwrap();
            for i in 0..counts.len() {
                let expected: i32 = counts[..i].iter().sum();
                prop_assert_eq!(plan.offsets()[i], expected);
            }
            prop_assert_eq!(plan.total(), counts.iter().map(|&c| c as u64).sum::<u64>());
        }
    }
}
