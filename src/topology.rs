//! Immutable per-run process facts.

use crate::comm::Communicator;
use crate::error::{Error, Result};

/// Rank of the process that reads configuration, votes and writes records.
pub const COORDINATOR: i32 = 0;

/// Who this process is and how many peers it has.
///
/// Built once from a communicator and passed by value into every component.
/// A group of fewer than two processes is rejected here, before any
/// collective call is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessTopology {
    rank: i32,
    size: i32,
}

impl ProcessTopology {
    /// Build a topology, rejecting groups smaller than two.
    pub fn new(rank: i32, size: i32) -> Result<Self> {
        if size < 2 {
            return Err(Error::GroupTooSmall(size));
        }
        if rank < 0 || rank >= size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(ProcessTopology { rank, size })
    }

    /// Read rank and size from a communicator.
    pub fn of<C: Communicator>(comm: &C) -> Result<Self> {
        Self::new(comm.rank(), comm.size())
    }

    /// Rank of this process.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Rank of this process as an index.
    pub fn index(&self) -> usize {
        self.rank as usize
    }

    /// Number of processes in the group.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Number of processes in the group as a length.
    pub fn group_len(&self) -> usize {
        self.size as usize
    }

    /// Whether this process is the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR
    }
}
