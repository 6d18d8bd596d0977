//! The collective operation under test and the buffers it moves.

use std::fmt;
use std::str::FromStr;

use crate::comm::Communicator;
use crate::datatype::Element;
use crate::error::{Error, Result};
use crate::plan::{prefix_offsets, DistributionPlan, Envelope};
use crate::topology::{ProcessTopology, COORDINATOR};

/// Collective operations the harness can time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Collective {
    /// Coordinator sends its block to everyone
    Broadcast,
    /// Coordinator sends block `i` to rank `i`
    #[default]
    Scatterv,
    /// Rank `i` sends its block to the coordinator
    Gatherv,
    /// Every rank receives every rank's equally sized block
    Allgather,
    /// Every rank receives every rank's block
    Allgatherv,
    /// Rank `i` sends a personalized block to each rank `j`
    Alltoallv,
}

impl Collective {
    /// All supported operations.
    pub const ALL: [Collective; 6] = [
        Collective::Broadcast,
        Collective::Scatterv,
        Collective::Gatherv,
        Collective::Allgather,
        Collective::Allgatherv,
        Collective::Alltoallv,
    ];

    /// Name used on the command line and in reports.
    pub fn name(self) -> &'static str {
        match self {
            Collective::Broadcast => "bcast",
            Collective::Scatterv => "scatterv",
            Collective::Gatherv => "gatherv",
            Collective::Allgather => "allgather",
            Collective::Allgatherv => "allgatherv",
            Collective::Alltoallv => "alltoallv",
        }
    }

    /// Check that `plan` describes a valid layout for this operation.
    pub fn validate(self, plan: &DistributionPlan) -> Result<()> {
        match self {
            Collective::Allgather if !plan.is_uniform() => Err(Error::InvalidOption(
                "allgather needs the same count on every process".into(),
            )),
            Collective::Alltoallv => Ok(()),
            _ if plan.has_peer_matrix() => Err(Error::InvalidOption(format!(
                "{} takes a single row of counts, not a matrix",
                self.name()
            ))),
            _ => Ok(()),
        }
    }
}

impl FromStr for Collective {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        Collective::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .or(match lower.as_str() {
                "broadcast" => Some(Collective::Broadcast),
                "scatter" => Some(Collective::Scatterv),
                "gather" => Some(Collective::Gatherv),
                "alltoall" | "alltoallw" => Some(Collective::Alltoallv),
                _ => None,
            })
            .ok_or_else(|| Error::InvalidOption(format!("unknown collective '{s}'")))
    }
}

impl fmt::Display for Collective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-rank send/receive layout of one operation.
#[derive(Debug, Clone, Default)]
struct Layout {
    send_counts: Vec<i32>,
    send_displs: Vec<i32>,
    recv_counts: Vec<i32>,
    recv_displs: Vec<i32>,
}

/// Buffers and layout for repeatedly invoking one collective.
///
/// Owns every buffer the operation touches; they are released when the
/// workload goes out of scope, on success and error paths alike.
#[derive(Debug)]
pub struct Workload<T: Element> {
    collective: Collective,
    topology: ProcessTopology,
    send: Vec<T>,
    recv: Vec<T>,
    layout: Layout,
}

impl<T: Element> Workload<T> {
    /// Allocate and fill the buffers for `collective` under `plan`.
    ///
    /// Data originating at participant `p` is filled with
    /// `T::fill_value(p + 1)` so zeroed receive buffers never look valid.
    /// Ranks with nothing to contribute leave their send side empty.
    pub fn prepare(
        collective: Collective,
        plan: &DistributionPlan,
        topology: ProcessTopology,
        envelope: Envelope,
    ) -> Result<Self> {
        collective.validate(plan)?;
        let me = topology.index();
        let root = COORDINATOR as usize;
        let total = plan.total() as usize;
        let counts = plan.counts();

        let mut layout = Layout::default();
        let (send_len, recv_len) = match collective {
            Collective::Broadcast => (counts[root] as usize, 0),
            Collective::Scatterv => {
                let send_len = if topology.is_coordinator() { total } else { 0 };
                (send_len, counts[me] as usize)
            }
            Collective::Gatherv => {
                let recv_len = if topology.is_coordinator() { total } else { 0 };
                (counts[me] as usize, recv_len)
            }
            Collective::Allgather | Collective::Allgatherv => (counts[me] as usize, total),
            Collective::Alltoallv => {
                let send_counts = plan.send_counts(me);
                let recv_counts = plan.recv_counts(me);
                layout.send_displs = prefix_offsets(&send_counts)?;
                layout.recv_displs = prefix_offsets(&recv_counts)?;
                let send_len = send_counts.iter().map(|&c| c as usize).sum();
                let recv_len = recv_counts.iter().map(|&c| c as usize).sum();
                layout.send_counts = send_counts;
                layout.recv_counts = recv_counts;
                (send_len, recv_len)
            }
        };
        if !matches!(collective, Collective::Alltoallv) {
            layout.send_counts = counts.to_vec();
            layout.send_displs = plan.offsets().to_vec();
            layout.recv_counts = counts.to_vec();
            layout.recv_displs = plan.offsets().to_vec();
        }

        let send_bytes = (send_len * T::SIZE) as u64;
        let recv_bytes = (recv_len * T::SIZE) as u64;
        envelope.check(send_bytes.max(recv_bytes))?;
        let mut send = allocate::<T>(send_len)?;
        let recv = allocate::<T>(recv_len)?;

        match collective {
            Collective::Broadcast if topology.is_coordinator() => {
                send.fill(T::fill_value(root + 1));
            }
            Collective::Broadcast => {}
            Collective::Scatterv => {
                if topology.is_coordinator() {
                    for (i, (&c, &o)) in counts.iter().zip(plan.offsets()).enumerate() {
                        send[o as usize..(o + c) as usize].fill(T::fill_value(i + 1));
                    }
                }
            }
            _ => send.fill(T::fill_value(me + 1)),
        }

        Ok(Workload {
            collective,
            topology,
            send,
            recv,
            layout,
        })
    }

    /// The operation this workload runs.
    pub fn collective(&self) -> Collective {
        self.collective
    }

    /// Elements this rank sends per invocation.
    pub fn send_len(&self) -> usize {
        self.send.len()
    }

    /// Elements this rank receives per invocation.
    pub fn recv_len(&self) -> usize {
        self.recv.len()
    }

    /// Perform exactly one invocation of the collective.
    pub fn invoke<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        let l = &self.layout;
        match self.collective {
            Collective::Broadcast => comm.broadcast(&mut self.send, COORDINATOR),
            Collective::Scatterv => comm.scatterv(
                &self.send,
                &l.send_counts,
                &l.send_displs,
                &mut self.recv,
                COORDINATOR,
            ),
            Collective::Gatherv => comm.gatherv(
                &self.send,
                &mut self.recv,
                &l.recv_counts,
                &l.recv_displs,
                COORDINATOR,
            ),
            Collective::Allgather => comm.allgather(&self.send, &mut self.recv),
            Collective::Allgatherv => {
                comm.allgatherv(&self.send, &mut self.recv, &l.recv_counts, &l.recv_displs)
            }
            Collective::Alltoallv => comm.alltoallv(
                &self.send,
                &l.send_counts,
                &l.send_displs,
                &mut self.recv,
                &l.recv_counts,
                &l.recv_displs,
            ),
        }
    }

    /// Check that the last invocation delivered the expected fill pattern.
    pub fn verify(&self) -> Result<()> {
        let me = self.topology.index();
        let root = COORDINATOR as usize;
        match self.collective {
            Collective::Broadcast => check_block(&self.send, 0, root),
            Collective::Scatterv => check_block(&self.recv, 0, me),
            Collective::Gatherv if !self.topology.is_coordinator() => Ok(()),
            _ => {
                let l = &self.layout;
                for (source, (&c, &d)) in l.recv_counts.iter().zip(&l.recv_displs).enumerate() {
                    let start = d as usize;
                    check_block(&self.recv[start..start + c as usize], start, source)?;
                }
                Ok(())
            }
        }
    }
}

fn check_block<T: Element>(block: &[T], base: usize, source: usize) -> Result<()> {
    let expected = T::fill_value(source + 1);
    match block.iter().position(|v| *v != expected) {
        Some(index) => Err(Error::Verification {
            source_rank: source,
            index: base + index,
        }),
        None => Ok(()),
    }
}

fn allocate<T: Element>(len: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::Allocation((len * T::SIZE) as u64))?;
    buf.resize(len, T::default());
    Ok(buf)
}
