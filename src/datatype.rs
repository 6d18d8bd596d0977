//! Element-kind descriptor for benchmark payloads.
//!
//! This module provides the [`Element`] trait, a sealed trait that maps Rust
//! primitive types to transport datatype tags and describes how a payload of
//! that type is filled, so one harness serves every payload type.
//!
//! # Supported Types
//!
//! | Rust Type | MPI Equivalent | Tag Value | CLI name |
//! |-----------|----------------|-----------|----------|
//! | `f64`     | `MPI_DOUBLE`   | 0         | `f64`    |
//! | `i32`     | `MPI_INT32_T`  | 1         | `i32`    |
//! | `u8`      | `MPI_UINT8_T`  | 2         | `u8`     |
//! | `u64`     | `MPI_UINT64_T` | 3         | n/a      |

use std::fmt::Debug;
use std::str::FromStr;

use crate::error::Error;
use crate::ReduceOp;

/// Seals [`Element`] against outside implementations.
mod sealed {
    pub trait Sealed {}
}

/// Tag values matching the `COLLBENCH_*` defines in `csrc/collbench.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DatatypeTag {
    /// 64-bit floating point (`MPI_DOUBLE`)
    F64 = 0,
    /// 32-bit signed integer (`MPI_INT32_T`)
    I32 = 1,
    /// 8-bit unsigned integer (`MPI_UINT8_T`)
    U8 = 2,
    /// 64-bit unsigned integer (`MPI_UINT64_T`)
    U64 = 3,
}

/// Trait for types that can travel as benchmark payloads.
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
/// `u64` is implemented for harness bookkeeping (trial counts) and is not
/// offered as a payload kind on the command line.
pub trait Element: sealed::Sealed + Copy + Default + PartialEq + Debug + Send + 'static {
    /// The datatype tag used for dispatch to the transport.
    const TAG: DatatypeTag;

    /// Size of one element in bytes.
    const SIZE: usize = std::mem::size_of::<Self>();

    /// Deterministic fill value for data tagged with participant `index`.
    fn fill_value(index: usize) -> Self;

    /// Combine two values under a reduction operation.
    fn combine(self, other: Self, op: ReduceOp) -> Self;
}

macro_rules! combine_int {
    ($a:expr, $b:expr, $op:expr) => {
        match $op {
            ReduceOp::Sum => $a.wrapping_add($b),
            ReduceOp::Max => $a.max($b),
            ReduceOp::Min => $a.min($b),
            ReduceOp::Prod => $a.wrapping_mul($b),
        }
    };
}

impl sealed::Sealed for f64 {}
impl Element for f64 {
    const TAG: DatatypeTag = DatatypeTag::F64;

    fn fill_value(index: usize) -> Self {
        index as f64
    }

    fn combine(self, other: Self, op: ReduceOp) -> Self {
        match op {
            ReduceOp::Sum => self + other,
            ReduceOp::Max => self.max(other),
            ReduceOp::Min => self.min(other),
            ReduceOp::Prod => self * other,
        }
    }
}

impl sealed::Sealed for i32 {}
impl Element for i32 {
    const TAG: DatatypeTag = DatatypeTag::I32;

    fn fill_value(index: usize) -> Self {
        index as i32
    }

    fn combine(self, other: Self, op: ReduceOp) -> Self {
        combine_int!(self, other, op)
    }
}

impl sealed::Sealed for u8 {}
impl Element for u8 {
    const TAG: DatatypeTag = DatatypeTag::U8;

    fn fill_value(index: usize) -> Self {
        (index % 256) as u8
    }

    fn combine(self, other: Self, op: ReduceOp) -> Self {
        combine_int!(self, other, op)
    }
}

impl sealed::Sealed for u64 {}
impl Element for u64 {
    const TAG: DatatypeTag = DatatypeTag::U64;

    fn fill_value(index: usize) -> Self {
        index as u64
    }

    fn combine(self, other: Self, op: ReduceOp) -> Self {
        combine_int!(self, other, op)
    }
}

/// Payload kind selected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementKind {
    /// `f64` payloads
    #[default]
    F64,
    /// `i32` payloads
    I32,
    /// `u8` payloads
    U8,
}

impl ElementKind {
    /// Size of one element of this kind in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementKind::F64 => f64::SIZE,
            ElementKind::I32 => i32::SIZE,
            ElementKind::U8 => u8::SIZE,
        }
    }

    /// Name accepted on the command line.
    pub fn name(self) -> &'static str {
        match self {
            ElementKind::F64 => "f64",
            ElementKind::I32 => "i32",
            ElementKind::U8 => "u8",
        }
    }
}

impl FromStr for ElementKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f64" | "double" => Ok(ElementKind::F64),
            "i32" | "int" => Ok(ElementKind::I32),
            "u8" | "char" | "byte" => Ok(ElementKind::U8),
            other => Err(Error::InvalidOption(format!("unknown element kind '{other}'"))),
        }
    }
}
