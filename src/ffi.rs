//! Raw FFI bindings to the C shim in `csrc/collbench.c`.
//!
//! These are low-level unsafe functions. Use [`MpiComm`](crate::MpiComm).
//! Every function returns an MPI error code (`0` on success) unless noted.

#![allow(non_camel_case_types)]

use std::os::raw::{c_double, c_int, c_void};

// Type aliases matching the C header
pub type int32_t = i32;
pub type int64_t = i64;

unsafe extern "C" {
    // ============================================================
    // Initialization and Finalization
    // ============================================================

    pub fn collbench_init() -> c_int;
    pub fn collbench_finalize() -> c_int;
    pub fn collbench_initialized(flag: *mut c_int) -> c_int;

    // ============================================================
    // World communicator
    // ============================================================

    pub fn collbench_comm_rank(rank: *mut int32_t) -> c_int;
    pub fn collbench_comm_size(size: *mut int32_t) -> c_int;
    pub fn collbench_barrier() -> c_int;
    pub fn collbench_abort(errorcode: c_int) -> c_int;

    /// Returns seconds, not an error code.
    pub fn collbench_wtime() -> c_double;

    // ============================================================
    // Point-to-Point
    // ============================================================

    pub fn collbench_send(
        buf: *const c_void,
        count: int64_t,
        datatype_tag: int32_t,
        dest: int32_t,
        tag: int32_t,
    ) -> c_int;

    pub fn collbench_recv(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        source: int32_t,
        tag: int32_t,
        actual_source: *mut int32_t,
        actual_tag: *mut int32_t,
        actual_count: *mut int64_t,
    ) -> c_int;

    // ============================================================
    // Collectives
    // ============================================================

    pub fn collbench_bcast(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        root: int32_t,
    ) -> c_int;

    pub fn collbench_reduce(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        op: int32_t,
        root: int32_t,
    ) -> c_int;

    pub fn collbench_gather(
        sendbuf: *const c_void,
        sendcount: int64_t,
        recvbuf: *mut c_void,
        recvcount: int64_t,
        datatype_tag: int32_t,
        root: int32_t,
    ) -> c_int;

    pub fn collbench_allgather(
        sendbuf: *const c_void,
        sendcount: int64_t,
        recvbuf: *mut c_void,
        recvcount: int64_t,
        datatype_tag: int32_t,
    ) -> c_int;

    pub fn collbench_gatherv(
        sendbuf: *const c_void,
        sendcount: int64_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        displs: *const int32_t,
        datatype_tag: int32_t,
        root: int32_t,
    ) -> c_int;

    pub fn collbench_scatterv(
        sendbuf: *const c_void,
        sendcounts: *const int32_t,
        displs: *const int32_t,
        recvbuf: *mut c_void,
        recvcount: int64_t,
        datatype_tag: int32_t,
        root: int32_t,
    ) -> c_int;

    pub fn collbench_allgatherv(
        sendbuf: *const c_void,
        sendcount: int64_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        displs: *const int32_t,
        datatype_tag: int32_t,
    ) -> c_int;

    pub fn collbench_alltoallv(
        sendbuf: *const c_void,
        sendcounts: *const int32_t,
        sdispls: *const int32_t,
        recvbuf: *mut c_void,
        recvcounts: *const int32_t,
        rdispls: *const int32_t,
        datatype_tag: int32_t,
    ) -> c_int;
}
