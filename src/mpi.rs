//! The MPI substrate.
//!
//! [`Mpi`] owns the MPI environment and [`MpiComm`] implements
//! [`Communicator`] over `MPI_COMM_WORLD` through the C shim.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::comm::{check_layout, check_rank, Communicator, ANY_SOURCE};
use crate::datatype::Element;
use crate::error::{Error, Result};
use crate::ffi;
use crate::status::Status;
use crate::ReduceOp;

/// Global flag tracking whether MPI has been initialized
static MPI_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// MPI environment handle.
///
/// There can only be one instance of this type at a time. When dropped, it
/// finalizes MPI.
///
/// # Example
///
/// ```no_run
/// use collbench::{Communicator, Mpi};
///
/// let mpi = Mpi::init().expect("Failed to initialize MPI");
/// let world = mpi.world();
/// println!("Running on {} processes", world.size());
/// // MPI is finalized when `mpi` goes out of scope
/// ```
pub struct Mpi {
    /// Marker to make Mpi !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl Mpi {
    /// Initialize MPI.
    ///
    /// # Errors
    ///
    /// Returns an error if MPI is already initialized or if initialization fails.
    pub fn init() -> Result<Self> {
        if MPI_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal("MPI already initialized".into()));
        }

        let ret = unsafe { ffi::collbench_init() };
        if ret != 0 {
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::from_code(ret));
        }

        Ok(Mpi {
            _marker: PhantomData,
        })
    }

    /// Get a handle to `MPI_COMM_WORLD`.
    pub fn world(&self) -> MpiComm<'_> {
        MpiComm {
            _env: PhantomData,
        }
    }

    /// Check if MPI has been initialized.
    pub fn is_initialized() -> bool {
        let mut flag: i32 = 0;
        unsafe { ffi::collbench_initialized(&mut flag) };
        flag != 0
    }
}

impl Drop for Mpi {
    fn drop(&mut self) {
        if MPI_INITIALIZED.load(Ordering::SeqCst) {
            unsafe {
                ffi::collbench_finalize();
            }
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}

/// `MPI_COMM_WORLD`, valid while the [`Mpi`] it came from is alive.
pub struct MpiComm<'env> {
    _env: PhantomData<&'env Mpi>,
}

impl MpiComm<'_> {
    fn check_count(len: usize) -> Result<i64> {
        i64::try_from(len).map_err(|_| Error::InvalidCount(i64::MAX))
    }
}

impl Communicator for MpiComm<'_> {
    fn rank(&self) -> i32 {
        let mut rank: i32 = 0;
        unsafe { ffi::collbench_comm_rank(&mut rank) };
        rank
    }

    fn size(&self) -> i32 {
        let mut size: i32 = 0;
        unsafe { ffi::collbench_comm_size(&mut size) };
        size
    }

    fn wtime(&self) -> f64 {
        unsafe { ffi::collbench_wtime() }
    }

    fn barrier(&self) -> Result<()> {
        let ret = unsafe { ffi::collbench_barrier() };
        Error::check(ret)
    }

    fn abort(&self, errorcode: i32) {
        // MPI_Abort does not return on conforming implementations.
        unsafe { ffi::collbench_abort(errorcode) };
    }

    fn send<T: Element>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        check_rank(dest, self.size())?;
        let ret = unsafe {
            ffi::collbench_send(
                data.as_ptr().cast::<c_void>(),
                Self::check_count(data.len())?,
                T::TAG as i32,
                dest,
                tag,
            )
        };
        Error::check(ret)
    }

    fn recv<T: Element>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status> {
        if source != ANY_SOURCE {
            check_rank(source, self.size())?;
        }
        let mut status = Status {
            source: 0,
            tag: 0,
            count: 0,
        };
        let ret = unsafe {
            ffi::collbench_recv(
                data.as_mut_ptr().cast::<c_void>(),
                Self::check_count(data.len())?,
                T::TAG as i32,
                source,
                tag,
                &mut status.source,
                &mut status.tag,
                &mut status.count,
            )
        };
        Error::check(ret)?;
        Ok(status)
    }

    fn broadcast<T: Element>(&self, data: &mut [T], root: i32) -> Result<()> {
        check_rank(root, self.size())?;
        let ret = unsafe {
            ffi::collbench_bcast(
                data.as_mut_ptr().cast::<c_void>(),
                Self::check_count(data.len())?,
                T::TAG as i32,
                root,
            )
        };
        Error::check(ret)
    }

    fn reduce<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
        root: i32,
    ) -> Result<()> {
        check_rank(root, self.size())?;
        if self.rank() == root && send.len() != recv.len() {
            return Err(Error::InvalidBuffer(format!(
                "reduce buffers differ in length ({} vs {})",
                send.len(),
                recv.len()
            )));
        }
        let ret = unsafe {
            ffi::collbench_reduce(
                send.as_ptr().cast::<c_void>(),
                recv.as_mut_ptr().cast::<c_void>(),
                Self::check_count(send.len())?,
                T::TAG as i32,
                op as i32,
                root,
            )
        };
        Error::check(ret)
    }

    fn gather<T: Element>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        check_rank(root, self.size())?;
        if self.rank() == root && recv.len() != send.len() * self.size() as usize {
            return Err(Error::InvalidBuffer(format!(
                "gather needs {} receive elements, got {}",
                send.len() * self.size() as usize,
                recv.len()
            )));
        }
        let count = Self::check_count(send.len())?;
        let ret = unsafe {
            ffi::collbench_gather(
                send.as_ptr().cast::<c_void>(),
                count,
                recv.as_mut_ptr().cast::<c_void>(),
                count,
                T::TAG as i32,
                root,
            )
        };
        Error::check(ret)
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
        if self.rank() == root {
            check_layout(recvcounts, displs, self.size(), recv.len())?;
        }
        let ret = unsafe {
            ffi::collbench_gatherv(
                send.as_ptr().cast::<c_void>(),
                Self::check_count(send.len())?,
                recv.as_mut_ptr().cast::<c_void>(),
                recvcounts.as_ptr(),
                displs.as_ptr(),
                T::TAG as i32,
                root,
            )
        };
        Error::check(ret)
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
        if self.rank() == root {
            check_layout(sendcounts, displs, self.size(), send.len())?;
        }
        let ret = unsafe {
            ffi::collbench_scatterv(
                send.as_ptr().cast::<c_void>(),
                sendcounts.as_ptr(),
                displs.as_ptr(),
                recv.as_mut_ptr().cast::<c_void>(),
                Self::check_count(recv.len())?,
                T::TAG as i32,
                root,
            )
        };
        Error::check(ret)
    }

    fn allgather<T: Element>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        if recv.len() != send.len() * self.size() as usize {
            return Err(Error::InvalidBuffer(format!(
                "allgather needs {} receive elements, got {}",
                send.len() * self.size() as usize,
                recv.len()
            )));
        }
        let count = Self::check_count(send.len())?;
        let ret = unsafe {
            ffi::collbench_allgather(
                send.as_ptr().cast::<c_void>(),
                count,
                recv.as_mut_ptr().cast::<c_void>(),
                count,
                T::TAG as i32,
            )
        };
        Error::check(ret)
    }

    fn allgatherv<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[i32],
        displs: &[i32],
    ) -> Result<()> {
        check_layout(recvcounts, displs, self.size(), recv.len())?;
        let ret = unsafe {
            ffi::collbench_allgatherv(
                send.as_ptr().cast::<c_void>(),
                Self::check_count(send.len())?,
                recv.as_mut_ptr().cast::<c_void>(),
                recvcounts.as_ptr(),
                displs.as_ptr(),
                T::TAG as i32,
            )
        };
        Error::check(ret)
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
        let ret = unsafe {
            ffi::collbench_alltoallv(
                send.as_ptr().cast::<c_void>(),
                sendcounts.as_ptr(),
                sdispls.as_ptr(),
                recv.as_mut_ptr().cast::<c_void>(),
                recvcounts.as_ptr(),
                rdispls.as_ptr(),
                T::TAG as i32,
            )
        };
        Error::check(ret)
    }
}
