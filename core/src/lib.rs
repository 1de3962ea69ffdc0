//! # tp-block
//!
//! `tp-block` checks that a transformer block split across a tensor-parallel group computes the
//! same thing as the unsplit block. It runs on the **CPU only**: ranks are threads, collectives
//! are ring exchanges over channels, and half precision is emulated by rounding `f32` values
//! through `f16`/`bf16` wherever a GPU kernel would store them.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: Core N-dimensional tensor implementation.
//! - [`precision`]: Storage formats and comparison tolerances.
//! - [`nn`]: Dense layers with explicit backward passes (Linear, LayerNorm, rotary attention,
//!   MLP) and the pre-norm [`Block`](nn::Block).
//! - [`distributed`]: Collective backends, the process grid and the SPMD launcher.
//! - [`parallel`]: Column/row-parallel linears and the sharded block.
//! - [`shard`]: How dense parameters map to per-rank shards.
//! - [`config`] and [`verify`]: The equivalence check and its settings.
//!
//! ## Example
//!
//! ```rust
//! use tp_block::config::BlockConfig;
//! use tp_block::precision::DType;
//! use tp_block::verify::verify_block_parallel;
//!
//! let cfg = BlockConfig {
//!     dim: 32,
//!     head_dim: 8,
//!     batch_size: 2,
//!     seqlen: 8,
//!     world_size: 2,
//!     dtype: DType::F16,
//!     ..BlockConfig::default()
//! };
//! let report = verify_block_parallel(&cfg).unwrap();
//! assert!(report.passed(), "{report}");
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use tp_block::tensor;
/// use tp_block::tensor::Tensor;
///
/// // Works
/// let t: Tensor<f32, 2> = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Length checked at compile time above.
        $crate::tensor::Tensor::new($data.to_vec(), SHAPE).unwrap()
    }};
}

pub mod config;
pub mod distributed;
pub mod error;
pub mod kernels;
pub mod nn;
pub mod parallel;
pub mod precision;
pub mod shard;
pub mod tensor;
pub mod verify;

pub use error::{Error, Result};
pub use precision::{DType, Tolerance};
pub use tensor::{Tensor, TensorElem, TensorError};
