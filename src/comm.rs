//! The message-passing substrate seam.
//!
//! [`Communicator`] is everything the harness needs from a messaging library:
//! blocking collectives over an addressable, ranked group, a full-group
//! barrier, reduce-to-one, point-to-point send/receive, a coordinated abort
//! and a high-resolution clock. Two implementations ship with the crate:
//! [`LocalComm`](crate::LocalComm) (threads in one process) and, with the
//! `mpi` feature, `MpiComm` over a system MPI library.
//!
//! Every call is blocking in the MPI sense: a collective returns only once
//! the calling rank's part is complete, and a barrier returns only once every
//! rank has entered it. There is no timeout.

use crate::datatype::Element;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::ReduceOp;

/// Wildcard source for [`Communicator::recv`].
pub const ANY_SOURCE: i32 = -1;

/// Wildcard tag for [`Communicator::recv`].
pub const ANY_TAG: i32 = -1;

/// A ranked group of cooperating processes.
///
/// # Example
///
/// ```
/// use collbench::{Communicator, LocalGroup};
///
/// let sums = LocalGroup::run(3, |world| {
///     let mut data = vec![0.0f64; 4];
///     if world.rank() == 0 {
///         data.fill(42.0);
///     }
///     world.broadcast(&mut data, 0)?;
///     Ok(data.iter().sum::<f64>())
/// })
/// .unwrap();
/// assert!(sums.iter().all(|s| matches!(s, Ok(v) if *v == 168.0)));
/// ```
pub trait Communicator {
    /// Rank of the calling process in this group.
    fn rank(&self) -> i32;

    /// Number of processes in this group.
    fn size(&self) -> i32;

    /// Wall-clock time in seconds, suitable for benchmarking.
    fn wtime(&self) -> f64;

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Barrier synchronization.
    ///
    /// No process returns until all processes have entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Tear down every process of the group with `errorcode`.
    ///
    /// Never a subset: a collective needs the full group, so anything short
    /// of a full teardown leaves the survivors blocked forever.
    fn abort(&self, errorcode: i32);

    // ========================================================================
    // Point-to-Point Communication
    // ========================================================================

    /// Send a contiguous block to `dest`.
    fn send<T: Element>(&self, data: &[T], dest: i32, tag: i32) -> Result<()>;

    /// Receive a contiguous block from `source` into `data`.
    ///
    /// Use [`ANY_SOURCE`] and [`ANY_TAG`] as wildcards. The message may be
    /// shorter than `data`; [`Status::count`] reports its length.
    fn recv<T: Element>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status>;

    // ========================================================================
    // Blocking Collectives
    // ========================================================================

    /// Broadcast `data` from `root` to all processes.
    fn broadcast<T: Element>(&self, data: &mut [T], root: i32) -> Result<()>;

    /// Element-wise reduction of `send` into `recv` on `root`.
    ///
    /// `recv` is only significant at root.
    fn reduce<T: Element>(&self, send: &[T], recv: &mut [T], op: ReduceOp, root: i32)
        -> Result<()>;

    /// Gather `send.len()` elements from every process to `root`.
    fn gather<T: Element>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()>;

    /// Variable-count gather to `root`.
    ///
    /// Rank `i` contributes `recvcounts[i]` elements placed at `displs[i]`.
    fn gatherv<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
        root: i32,
    ) -> Result<()>;

    /// Variable-count scatter from `root`.
    ///
    /// Rank `i` receives `sendcounts[i]` elements taken from `displs[i]`.
    fn scatterv<T: Element>(
        &self,
        send: &[T],
        sendcounts: &[i32],
        displs: &[i32],
        recv: &mut [T],
        root: i32,
    ) -> Result<()>;

    /// Gather `send.len()` elements from every process to every process.
    fn allgather<T: Element>(&self, send: &[T], recv: &mut [T]) -> Result<()>;

    /// Variable-count all-gather.
    fn allgatherv<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
    ) -> Result<()>;

    /// Personalized all-to-all exchange with per-peer counts and offsets.
    #[allow(clippy::too_many_arguments)]
    fn alltoallv<T: Element>(
        &self,
        send: &[T],
        sendcounts: &[i32],
        sdispls: &[i32],
        recv: &mut [T],
        recvcounts: &[i32],
        rdispls: &[i32],
    ) -> Result<()>;

    // ========================================================================
    // Scalar conveniences
    // ========================================================================

    /// Broadcast a single value from `root`.
    fn broadcast_scalar<T: Element>(&self, value: T, root: i32) -> Result<T> {
        let mut buf = [value];
        self.broadcast(&mut buf, root)?;
        Ok(buf[0])
    }

    /// Reduce a single value to `root`. The result is only significant at root.
    fn reduce_scalar<T: Element>(&self, value: T, op: ReduceOp, root: i32) -> Result<T> {
        let send = [value];
        let mut recv = [T::default()];
        self.reduce(&send, &mut recv, op, root)?;
        Ok(recv[0])
    }

    /// Gather one value per process to `root`, in rank order.
    ///
    /// Returns an empty vector on every other rank.
    fn gather_scalar<T: Element>(&self, value: T, root: i32) -> Result<Vec<T>> {
        let mut recv = if self.rank() == root {
            vec![T::default(); self.size() as usize]
        } else {
            Vec::new()
        };
        self.gather(&[value], &mut recv, root)?;
        Ok(recv)
    }
}

/// Validate a counts/displacements pair against a group and a buffer length.
pub(crate) fn check_layout(counts: &[i32], displs: &[i32], size: i32, len: usize) -> Result<()> {
    if counts.len() != size as usize || displs.len() != size as usize {
        return Err(Error::InvalidBuffer(format!(
            "expected {size} counts and displacements, got {} and {}",
            counts.len(),
            displs.len()
        )));
    }
    for (&c, &d) in counts.iter().zip(displs) {
        if c < 0 {
            return Err(Error::InvalidCount(i64::from(c)));
        }
        if d < 0 || d as usize + c as usize > len {
            return Err(Error::InvalidBuffer(format!(
                "block [{d}, {}) exceeds buffer of {len} elements",
                d as i64 + c as i64
            )));
        }
    }
    Ok(())
}

/// Validate a rank argument.
pub(crate) fn check_rank(rank: i32, size: i32) -> Result<()> {
    if rank < 0 || rank >= size {
        Err(Error::InvalidRank(rank))
    } else {
        Ok(())
    }
}
