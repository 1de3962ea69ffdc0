//! CPU kernels for `tp-block`.
//!
//! Kernels operate on flat row-major slices plus a shape and never allocate tensors of their own.
//! Keeping them in a separate crate lets the tensor layer swap a kernel (BLAS, a tiled variant)
//! without touching the layers built on top.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_matmul;
pub mod cpu_transpose;

pub use cpu_matmul::{cpu_matmul, cpu_matmul_nt};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Kernel requires rank >= {required}, got rank {got}")]
    RankTooLow { required: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

pub(crate) fn require_rank<const RANK: usize>(required: usize) -> Result<()> {
    if RANK < required {
        return Err(KernelError::RankTooLow {
            required,
            got: RANK,
        });
    }
    Ok(())
}
