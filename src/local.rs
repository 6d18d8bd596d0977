//! In-process message-passing substrate.
//!
//! [`LocalGroup`] runs every rank of a group as a thread of the current
//! process. Each rank is still single-threaded: it owns a [`LocalComm`] and
//! talks to its peers only through messages, exactly as it would over MPI.
//!
//! Sends are buffered (they never wait for the receiver); receives, barriers
//! and collectives block until their peers arrive. A group abort wakes every
//! blocked rank with [`Error::Aborted`], which is the only way out of a
//! collective that a peer never joins.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use tracing::{trace, warn};

use crate::comm::{check_layout, check_rank, Communicator, ANY_SOURCE, ANY_TAG};
use crate::datatype::Element;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::ReduceOp;

// Collectives travel on negative tags so wildcard receives never see them.
const TAG_BCAST: i32 = -10;
const TAG_REDUCE: i32 = -11;
const TAG_GATHER: i32 = -12;
const TAG_SCATTER: i32 = -13;
const TAG_ALLTOALL: i32 = -14;

struct Envelope {
    source: usize,
    tag: i32,
    payload: Box<dyn Any + Send>,
}

impl Envelope {
    fn matches(&self, source: i32, tag: i32) -> bool {
        let source_ok = source == ANY_SOURCE || self.source == source as usize;
        let tag_ok = if tag == ANY_TAG {
            self.tag >= 0
        } else {
            self.tag == tag
        };
        source_ok && tag_ok
    }
}

struct State {
    /// One inbox per destination rank, in arrival order.
    mailboxes: Vec<VecDeque<Envelope>>,
    arrived: usize,
    generation: u64,
    aborted: Option<i32>,
}

struct Shared {
    size: usize,
    epoch: Instant,
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking rank never holds the lock across user code, so the
        // state behind a poisoned mutex is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, State>) -> MutexGuard<'a, State> {
        self.wakeup.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn abort(&self, errorcode: i32) {
        let mut state = self.lock();
        if state.aborted.is_none() {
            warn!(errorcode, "aborting local group");
            state.aborted = Some(errorcode);
        }
        drop(state);
        self.wakeup.notify_all();
    }
}

/// Aborts the group if the owning rank thread unwinds.
struct AbortOnPanic(Arc<Shared>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort(1);
        }
    }
}

/// A group of ranks living in the current process.
///
/// # Example
///
/// ```
/// use collbench::{Communicator, LocalGroup};
///
/// let ranks = LocalGroup::run(4, |world| Ok(world.rank())).unwrap();
/// let ranks: Vec<i32> = ranks.into_iter().map(|r| r.unwrap()).collect();
/// assert_eq!(ranks, vec![0, 1, 2, 3]);
/// ```
pub struct LocalGroup {
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create a group of `size` ranks.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidCount(0));
        }
        let state = State {
            mailboxes: (0..size).map(|_| VecDeque::new()).collect(),
            arrived: 0,
            generation: 0,
            aborted: None,
        };
        Ok(LocalGroup {
            shared: Arc::new(Shared {
                size,
                epoch: Instant::now(),
                state: Mutex::new(state),
                wakeup: Condvar::new(),
            }),
        })
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<LocalComm> {
        (0..self.shared.size)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&self.shared),
            })
            .collect()
    }

    /// Tear down every rank of the group.
    pub fn abort(&self, errorcode: i32) {
        self.shared.abort(errorcode);
    }

    /// The abort code, if the group has been aborted.
    pub fn aborted(&self) -> Option<i32> {
        self.shared.lock().aborted
    }

    /// Run `f` on `size` rank threads and collect each rank's outcome.
    ///
    /// A rank that panics or returns a group-fatal error aborts the group, so
    /// its peers are released from whatever collective they are blocked in.
    pub fn run<R, F>(size: usize, f: F) -> Result<Vec<Result<R>>>
    where
        R: Send,
        F: Fn(LocalComm) -> Result<R> + Sync,
    {
        let group = LocalGroup::new(size)?;
        let comms = group.communicators();

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(size);
            let mut spawn_error = None;
            for comm in comms {
                let f = &f;
                let shared = Arc::clone(&comm.shared);
                let spawned = thread::Builder::new()
                    .name(format!("rank-{}", comm.rank))
                    .spawn_scoped(scope, move || {
                        let _guard = AbortOnPanic(Arc::clone(&shared));
                        let outcome = f(comm);
                        if let Err(e) = &outcome {
                            if e.is_group_fatal() {
                                shared.abort(e.exit_code());
                            }
                        }
                        outcome
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        group.abort(1);
                        spawn_error = Some(e);
                        break;
                    }
                }
            }

            let outcomes: Vec<Result<R>> = handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Internal(format!("rank {rank} panicked"))))
                })
                .collect();

            match spawn_error {
                Some(e) => Err(Error::Internal(format!("failed to spawn rank thread: {e}"))),
                None => Ok(outcomes),
            }
        })
    }
}

/// One rank's handle on a [`LocalGroup`].
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    fn post<T: Element>(&self, data: &[T], dest: usize, tag: i32) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(code) = state.aborted {
            return Err(Error::Aborted(code));
        }
        trace!(rank = self.rank, dest, tag, len = data.len(), "post");
        state.mailboxes[dest].push_back(Envelope {
            source: self.rank,
            tag,
            payload: Box::new(data.to_vec()),
        });
        drop(state);
        self.shared.wakeup.notify_all();
        Ok(())
    }

    fn take<T: Element>(&self, source: i32, tag: i32) -> Result<(usize, i32, Vec<T>)> {
        let mut state = self.shared.lock();
        loop {
            if let Some(code) = state.aborted {
                return Err(Error::Aborted(code));
            }
            let inbox = &mut state.mailboxes[self.rank];
            if let Some(pos) = inbox.iter().position(|env| env.matches(source, tag)) {
                if let Some(Envelope {
                    source: from,
                    tag: got,
                    payload,
                }) = inbox.remove(pos)
                {
                    trace!(rank = self.rank, from, tag = got, "take");
                    let payload = payload.downcast::<Vec<T>>().map_err(|_| {
                        Error::InvalidBuffer(format!(
                            "message from rank {from} does not carry {:?} elements",
                            T::TAG
                        ))
                    })?;
                    return Ok((from, got, *payload));
                }
            }
            state = self.shared.wait(state);
        }
    }

    fn recv_into<T: Element>(&self, buf: &mut [T], source: usize, tag: i32) -> Result<usize> {
        let (_, _, data) = self.take::<T>(source as i32, tag)?;
        if data.len() > buf.len() {
            return Err(Error::InvalidCount(data.len() as i64));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn recv_exact<T: Element>(&self, buf: &mut [T], source: usize, tag: i32) -> Result<()> {
        let n = self.recv_into(buf, source, tag)?;
        if n != buf.len() {
            return Err(Error::InvalidCount(n as i64));
        }
        Ok(())
    }

    fn uniform_layout(&self, count: usize) -> (Vec<i32>, Vec<i32>) {
        let counts = vec![count as i32; self.shared.size];
        let displs = (0..self.shared.size).map(|i| (i * count) as i32).collect();
        (counts, displs)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> i32 {
        self.rank as i32
    }

    fn size(&self) -> i32 {
        self.shared.size as i32
    }

    fn wtime(&self) -> f64 {
        self.shared.epoch.elapsed().as_secs_f64()
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if let Some(code) = state.aborted {
            return Err(Error::Aborted(code));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.arrived = 0;
            state.generation += 1;
            drop(state);
            self.shared.wakeup.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            if let Some(code) = state.aborted {
                return Err(Error::Aborted(code));
            }
            state = self.shared.wait(state);
        }
        Ok(())
    }

    fn abort(&self, errorcode: i32) {
        self.shared.abort(errorcode);
    }

    fn send<T: Element>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        check_rank(dest, self.size())?;
        if tag < 0 {
            return Err(Error::InvalidBuffer(format!("tag {tag} is reserved")));
        }
        self.post(data, dest as usize, tag)
    }

    fn recv<T: Element>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status> {
        if source != ANY_SOURCE {
            check_rank(source, self.size())?;
        }
        let (from, got, payload) = self.take::<T>(source, tag)?;
        if payload.len() > data.len() {
            return Err(Error::InvalidCount(payload.len() as i64));
        }
        data[..payload.len()].copy_from_slice(&payload);
        Ok(Status {
            source: from as i32,
            tag: got,
            count: payload.len() as i64,
        })
    }

    fn broadcast<T: Element>(&self, data: &mut [T], root: i32) -> Result<()> {
        check_rank(root, self.size())?;
        let root = root as usize;
        if self.rank == root {
            for dest in (0..self.shared.size).filter(|&r| r != root) {
                self.post(data, dest, TAG_BCAST)?;
            }
            Ok(())
        } else {
            self.recv_exact(data, root, TAG_BCAST)
        }
    }

    fn reduce<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
        root: i32,
    ) -> Result<()> {
        check_rank(root, self.size())?;
        let root = root as usize;
        if self.rank != root {
            return self.post(send, root, TAG_REDUCE);
        }
        if recv.len() != send.len() {
            return Err(Error::InvalidBuffer(format!(
                "reduce buffers differ in length ({} vs {})",
                send.len(),
                recv.len()
            )));
        }
        // Combine in rank order so floating-point sums are reproducible.
        for source in 0..self.shared.size {
            let values = if source == root {
                send.to_vec()
            } else {
                self.take::<T>(source as i32, TAG_REDUCE)?.2
            };
            if values.len() != send.len() {
                return Err(Error::InvalidCount(values.len() as i64));
            }
            if source == 0 {
                recv.copy_from_slice(&values);
            } else {
                for (acc, v) in recv.iter_mut().zip(values) {
                    *acc = acc.combine(v, op);
                }
            }
        }
        Ok(())
    }

    fn gather<T: Element>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        let (counts, displs) = self.uniform_layout(send.len());
        self.gatherv(send, recv, &counts, &displs, root)
    }

    fn gatherv<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
        root: i32,
    ) -> Result<()> {
        check_rank(root, self.size())?;
        let root = root as usize;
        if self.rank != root {
            return self.post(send, root, TAG_GATHER);
        }
        check_layout(recvcounts, displs, self.size(), recv.len())?;
        if send.len() != recvcounts[root] as usize {
            return Err(Error::InvalidCount(send.len() as i64));
        }
        for source in 0..self.shared.size {
            let start = displs[source] as usize;
            let block = &mut recv[start..start + recvcounts[source] as usize];
            if source == root {
                block.copy_from_slice(send);
            } else {
                self.recv_exact(block, source, TAG_GATHER)?;
            }
        }
        Ok(())
    }

    fn scatterv<T: Element>(
        &self,
        send: &[T],
        sendcounts: &[i32],
        displs: &[i32],
        recv: &mut [T],
        root: i32,
    ) -> Result<()> {
        check_rank(root, self.size())?;
        let root = root as usize;
        if self.rank != root {
            self.recv_into(recv, root, TAG_SCATTER)?;
            return Ok(());
        }
        check_layout(sendcounts, displs, self.size(), send.len())?;
        for dest in 0..self.shared.size {
            let start = displs[dest] as usize;
            let block = &send[start..start + sendcounts[dest] as usize];
            if dest == root {
                if recv.len() < block.len() {
                    return Err(Error::InvalidCount(block.len() as i64));
                }
                recv[..block.len()].copy_from_slice(block);
            } else {
                self.post(block, dest, TAG_SCATTER)?;
            }
        }
        Ok(())
    }

    fn allgather<T: Element>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        let (counts, displs) = self.uniform_layout(send.len());
        self.allgatherv(send, recv, &counts, &displs)
    }

    fn allgatherv<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
    ) -> Result<()> {
        check_layout(recvcounts, displs, self.size(), recv.len())?;
        self.gatherv(send, recv, recvcounts, displs, 0)?;
        self.broadcast(recv, 0)
    }

    fn alltoallv<T: Element>(
        &self,
        send: &[T],
        sendcounts: &[i32],
        sdispls: &[i32],
        recv: &mut [T],
        recvcounts: &[i32],
        rdispls: &[i32],
    ) -> Result<()> {
        check_layout(sendcounts, sdispls, self.size(), send.len())?;
        check_layout(recvcounts, rdispls, self.size(), recv.len())?;
        let me = self.rank;
        if sendcounts[me] != recvcounts[me] {
            return Err(Error::InvalidCount(i64::from(sendcounts[me])));
        }

        for dest in (0..self.shared.size).filter(|&r| r != me) {
            let start = sdispls[dest] as usize;
            self.post(&send[start..start + sendcounts[dest] as usize], dest, TAG_ALLTOALL)?;
        }

        let own = sdispls[me] as usize..(sdispls[me] + sendcounts[me]) as usize;
        let start = rdispls[me] as usize;
        recv[start..start + own.len()].copy_from_slice(&send[own]);

        for source in (0..self.shared.size).filter(|&r| r != me) {
            let start = rdispls[source] as usize;
            let block = &mut recv[start..start + recvcounts[source] as usize];
            self.recv_exact(block, source, TAG_ALLTOALL)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn all_ok<R: std::fmt::Debug>(outcomes: Vec<Result<R>>) -> Vec<R> {
        outcomes
            .into_iter()
            .map(|o| o.expect("rank failed"))
            .collect()
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let out = LocalGroup::run(4, |world| {
            let mut data = vec![0i32; 3];
            if world.rank() == 2 {
                data.copy_from_slice(&[7, 8, 9]);
            }
            world.broadcast(&mut data, 2)?;
            Ok(data)
        })
        .unwrap();
        for data in all_ok(out) {
            assert_eq!(data, vec![7, 8, 9]);
        }
    }

    #[test]
    fn reduce_min_max_sum_on_root() {
        let out = LocalGroup::run(3, |world| {
            let v = world.rank() as f64 + 1.0;
            let min = world.reduce_scalar(v, ReduceOp::Min, 0)?;
            let max = world.reduce_scalar(v, ReduceOp::Max, 0)?;
            let sum = world.reduce_scalar(v, ReduceOp::Sum, 0)?;
            Ok((world.rank(), min, max, sum))
        })
        .unwrap();
        let root = all_ok(out).into_iter().find(|r| r.0 == 0).unwrap();
        assert_eq!((root.1, root.2, root.3), (1.0, 3.0, 6.0));
    }

    #[test]
    fn gatherv_places_blocks_at_displacements() {
        let out = LocalGroup::run(3, |world| {
            let rank = world.rank() as usize;
            let send = vec![rank as u8; rank + 1];
            let counts = [1, 2, 3];
            let displs = [0, 1, 3];
            let mut recv = if rank == 0 { vec![9u8; 6] } else { vec![] };
            world.gatherv(&send, &mut recv, &counts, &displs, 0)?;
            Ok(recv)
        })
        .unwrap();
        assert_eq!(all_ok(out)[0], vec![0, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn scatterv_delivers_each_block() {
        let out = LocalGroup::run(3, |world| {
            let send: Vec<i32> = if world.rank() == 0 {
                vec![1, 2, 2, 3, 3, 3]
            } else {
                vec![]
            };
            let counts = [1, 2, 3];
            let displs = [0, 1, 3];
            let mut recv = vec![0i32; counts[world.rank() as usize] as usize];
            world.scatterv(&send, &counts, &displs, &mut recv, 0)?;
            Ok(recv)
        })
        .unwrap();
        assert_eq!(all_ok(out), vec![vec![1], vec![2, 2], vec![3, 3, 3]]);
    }

    #[test]
    fn allgather_and_alltoallv() {
        let out = LocalGroup::run(3, |world| {
            let rank = world.rank();
            let mut all = vec![0i32; 3];
            world.allgather(&[rank * 10], &mut all)?;

            // rank r sends one element (r) to every peer
            let send = vec![rank; 3];
            let ones = [1, 1, 1];
            let displs = [0, 1, 2];
            let mut recv = vec![-1i32; 3];
            world.alltoallv(&send, &ones, &displs, &mut recv, &ones, &displs)?;
            Ok((all, recv))
        })
        .unwrap();
        for (all, recv) in all_ok(out) {
            assert_eq!(all, vec![0, 10, 20]);
            assert_eq!(recv, vec![0, 1, 2]);
        }
    }

    #[test]
    fn point_to_point_reports_status() {
        let out = LocalGroup::run(2, |world| {
            if world.rank() == 1 {
                world.send(&[1.5f64, 2.5], 0, 4)?;
                Ok(None)
            } else {
                let mut buf = [0.0f64; 8];
                let status = world.recv(&mut buf, ANY_SOURCE, ANY_TAG)?;
                Ok(Some((status, buf[1])))
            }
        })
        .unwrap();
        let (status, second) = all_ok(out)[0].unwrap();
        assert_eq!(
            status,
            Status {
                source: 1,
                tag: 4,
                count: 2
            }
        );
        assert_eq!(second, 2.5);
    }

    #[test]
    fn reserved_tags_are_rejected() {
        let group = LocalGroup::new(2).unwrap();
        let comms = group.communicators();
        assert!(comms[0].send(&[1u8], 1, -3).is_err());
        assert!(matches!(comms[0].send(&[1u8], 5, 0), Err(Error::InvalidRank(5))));
    }

    #[test]
    fn barrier_blocks_until_released_by_abort() {
        let group = LocalGroup::new(3).unwrap();
        let mut comms = group.communicators();
        let _stalled = comms.pop();
        let (tx, rx) = mpsc::channel();
        for comm in comms {
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = tx.send(comm.barrier());
            });
        }
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());

        group.abort(9);
        for _ in 0..2 {
            let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(matches!(outcome, Err(Error::Aborted(9))));
        }
        assert_eq!(group.aborted(), Some(9));
    }

    #[test]
    fn fatal_error_on_one_rank_releases_the_others() {
        let out = LocalGroup::run(3, |world| {
            if world.rank() == 1 {
                return Err(Error::NoSamples);
            }
            world.barrier()
        })
        .unwrap();
        assert!(matches!(out[1], Err(Error::NoSamples)));
        let code = Error::NoSamples.exit_code();
        assert!(matches!(out[0], Err(Error::Aborted(c)) if c == code));
        assert!(matches!(out[2], Err(Error::Aborted(c)) if c == code));
    }

    #[test]
    fn panicking_rank_aborts_the_group() {
        let out = LocalGroup::run(2, |world| {
            if world.rank() == 0 {
                panic!("boom");
            }
            world.barrier()
        })
        .unwrap();
        assert!(matches!(out[0], Err(Error::Internal(_))));
        assert!(matches!(out[1], Err(Error::Aborted(1))));
    }

    #[test]
    fn wtime_is_monotonic() {
        let group = LocalGroup::new(2).unwrap();
        let comms = group.communicators();
        let a = comms[0].wtime();
        let b = comms[1].wtime();
        assert!(b >= a);
    }
}
