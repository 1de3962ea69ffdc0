//! Tensor- and sequence-parallel versions of the block layers.
//!
//! The attention and MLP code is the dense code instantiated with [`TensorParallelLinear`]
//! projections, so the sharded model runs exactly the reference arithmetic on its slice of the
//! weights. Only the communication around the projections differs.

pub mod linear;

pub use linear::{ParallelStrategy, TensorParallelLinear};

use crate::distributed::backend::CollectiveBackend;
use crate::error::Result;
use crate::nn::block::Block;
use crate::nn::mha::MultiHeadAttention;
use crate::nn::mlp::Mlp;
use crate::nn::module::Module;
use crate::precision::DType;
use tracing::debug;

/// `Wqkv` column parallel over heads, `out_proj` row parallel.
pub type ParallelMultiHeadAttention = MultiHeadAttention<TensorParallelLinear>;

/// `fc1` column parallel, `fc2` row parallel.
pub type ParallelMlp = Mlp<TensorParallelLinear>;

pub type ParallelBlock = Block<ParallelMultiHeadAttention, ParallelMlp>;

/// Sums the gradients of every sequence-parallel parameter over the group.
///
/// Replicated parameters applied to row-sharded activations (the layer norms) only see this
/// rank's tokens. Parameters are visited in sorted-name order so every rank issues the same
/// collectives even when ranks own different parameter sets. Gradients are rounded to `dtype`
/// after the reduction.
pub fn all_reduce_sequence_parallel_grads<M: Module + ?Sized>(
    module: &mut M,
    group: &dyn CollectiveBackend,
    dtype: DType,
) -> Result<()> {
    let mut params: Vec<_> = module
        .named_parameters_mut()
        .into_iter()
        .filter(|(_, entry)| entry.sequence_parallel)
        .collect();
    params.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (name, entry) in params {
        let Some(grad) = entry.grad else {
            return Err(crate::Error::precondition(format!(
                "sequence-parallel parameter {name} has no gradient"
            )));
        };
        group.all_reduce_sum(grad)?;
        dtype.round_slice(grad);
        debug!(rank = group.rank(), %name, "all-reduced sequence-parallel gradient");
    }
    Ok(())
}
