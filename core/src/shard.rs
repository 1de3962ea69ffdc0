//! How the dense block's parameters are split over a tensor-parallel group.
//!
//! With `p = dim / ws` and `q = hidden / ws`, rank `r` holds:
//!
//! | parameter | shard |
//! |---|---|
//! | `Wqkv.weight [3 dim, dim]` | rows `[r p, (r+1) p)` of each of q, k, v → `[3 p, dim]` |
//! | `Wqkv.bias [3 dim]` | the same slices → `[3 p]` |
//! | `out_proj.weight [dim, dim]` | columns `[r p, (r+1) p)` |
//! | `out_proj.bias` | rank 0 only |
//! | `fc1.weight [hidden, dim]`, `fc1.bias` | rows / entries `[r q, (r+1) q)` |
//! | `fc2.weight [dim, hidden]` | columns `[r q, (r+1) q)` |
//! | `fc2.bias` | rank 0 only |
//! | norms | replicated |
//!
//! The same functions slice reference gradients for comparison with a rank's gradients.

use crate::distributed::state::ParallelState;
use crate::error::Result;
use crate::nn::attention::SelfAttention;
use crate::nn::block::{Block, BlockOptions, DenseBlock};
use crate::nn::linear::Linear;
use crate::nn::mha::MultiHeadAttention;
use crate::nn::mlp::Mlp;
use crate::nn::norm::LayerNorm;
use crate::parallel::{ParallelBlock, ParallelStrategy, TensorParallelLinear};
use crate::tensor::Tensor;
use tracing::debug;

fn split_len(len: usize, rank: usize, world_size: usize, what: &str) -> Result<usize> {
    crate::ensure!(world_size > 0, "world size must be positive");
    crate::ensure!(rank < world_size, "rank {rank} outside world of {world_size}");
    crate::ensure!(
        len % world_size == 0,
        "{what} of size {len} is not divisible by world size {world_size}"
    );
    Ok(len / world_size)
}

/// Output-feature slice of a column-parallel weight.
pub fn shard_rows(w: &Tensor<f32, 2>, rank: usize, world_size: usize) -> Result<Tensor<f32, 2>> {
    let len = split_len(w.rows(), rank, world_size, "weight rows")?;
    Ok(w.narrow_rows(rank * len, len)?)
}

/// Input-feature slice of a row-parallel weight.
pub fn shard_cols(w: &Tensor<f32, 2>, rank: usize, world_size: usize) -> Result<Tensor<f32, 2>> {
    let len = split_len(w.cols(), rank, world_size, "weight columns")?;
    Ok(w.narrow_cols(rank * len, len)?)
}

pub fn shard_vector(v: &Tensor<f32, 1>, rank: usize, world_size: usize) -> Result<Tensor<f32, 1>> {
    let len = split_len(v.shape()[0], rank, world_size, "vector")?;
    Ok(v.narrow(rank * len, len)?)
}

/// Keeps this rank's heads of each of the q, k and v projections of a packed `[3 dim, dim]`
/// weight.
pub fn shard_qkv_weight(
    w: &Tensor<f32, 2>,
    rank: usize,
    world_size: usize,
) -> Result<Tensor<f32, 2>> {
    crate::ensure!(
        w.rows() % 3 == 0,
        "packed qkv weight has {} rows, not a multiple of 3",
        w.rows()
    );
    let dim = w.rows() / 3;
    let p = split_len(dim, rank, world_size, "qkv projection")?;
    let parts = (0..3)
        .map(|i| w.narrow_rows(i * dim + rank * p, p))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Tensor::cat_rows(&parts)?)
}

pub fn shard_qkv_bias(b: &Tensor<f32, 1>, rank: usize, world_size: usize) -> Result<Tensor<f32, 1>> {
    let len = b.shape()[0];
    crate::ensure!(len % 3 == 0, "packed qkv bias has {len} entries, not a multiple of 3");
    let dim = len / 3;
    let p = split_len(dim, rank, world_size, "qkv projection")?;
    let parts = (0..3)
        .map(|i| b.narrow(i * dim + rank * p, p))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Tensor::cat(&parts)?)
}

/// Copies a replicated norm without the reference's accumulated gradients.
fn replicate_norm(dense: &LayerNorm) -> Result<LayerNorm> {
    LayerNorm::new(
        dense.weight.value.clone(),
        dense.bias.value.clone(),
        dense.eps,
        dense.dtype,
    )
}

fn shard_linear(
    dense: &Linear,
    strategy: ParallelStrategy,
    rank: usize,
    world_size: usize,
) -> Result<Linear> {
    let (weight, bias) = match strategy {
        ParallelStrategy::Column => (
            shard_rows(&dense.weight.value, rank, world_size)?,
            dense
                .bias
                .as_ref()
                .map(|b| shard_vector(&b.value, rank, world_size))
                .transpose()?,
        ),
        ParallelStrategy::Row => (
            shard_cols(&dense.weight.value, rank, world_size)?,
            dense
                .bias
                .as_ref()
                .filter(|_| rank == 0)
                .map(|b| b.value.clone()),
        ),
    };
    Linear::new(weight, bias, dense.dtype)
}

impl ParallelBlock {
    /// Builds this rank's shard of `reference` with sequence parallelism enabled.
    pub fn from_reference(reference: &DenseBlock, state: &ParallelState) -> Result<Self> {
        let rank = state.tensor_parallel_rank();
        let ws = state.tensor_parallel_world_size();
        let group = state.group();
        let dense_attn = &reference.mixer.inner_attn;
        crate::ensure!(
            dense_attn.num_heads % ws == 0,
            "{} heads cannot be split over {ws} ranks",
            dense_attn.num_heads
        );

        let dense_wqkv = &reference.mixer.wqkv;
        let wqkv = Linear::new(
            shard_qkv_weight(&dense_wqkv.weight.value, rank, ws)?,
            dense_wqkv
                .bias
                .as_ref()
                .map(|b| shard_qkv_bias(&b.value, rank, ws))
                .transpose()?,
            dense_wqkv.dtype,
        )?;
        let out_proj = shard_linear(&reference.mixer.out_proj, ParallelStrategy::Row, rank, ws)?;
        let inner_attn = SelfAttention {
            num_heads: dense_attn.num_heads / ws,
            ..dense_attn.clone()
        };
        let mixer = MultiHeadAttention::new(
            TensorParallelLinear::new(wqkv, ParallelStrategy::Column, true, group.clone()),
            inner_attn,
            TensorParallelLinear::new(out_proj, ParallelStrategy::Row, true, group.clone()),
        );

        let fc1 = shard_linear(&reference.mlp.fc1, ParallelStrategy::Column, rank, ws)?;
        let fc2 = shard_linear(&reference.mlp.fc2, ParallelStrategy::Row, rank, ws)?;
        let mlp = Mlp::new(
            TensorParallelLinear::new(fc1, ParallelStrategy::Column, true, group.clone()),
            TensorParallelLinear::new(fc2, ParallelStrategy::Row, true, group),
            reference.mlp.dtype,
        );

        debug!(rank, world_size = ws, "sharded block from reference");
        Ok(Block::new(
            replicate_norm(&reference.norm1)?,
            mixer,
            replicate_norm(&reference.norm2)?,
            mlp,
            BlockOptions {
                sequence_parallel: true,
                ..reference.options
            },
        ))
    }
}
