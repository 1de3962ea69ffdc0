use crate::distributed::backend::CollectiveBackend;
use crate::distributed::ops::{
    all_reduce_tensor, gather_from_sequence_parallel_region,
    reduce_scatter_to_sequence_parallel_region,
};
use crate::error::Result;
use crate::nn::linear::{Linear, LinearCtx, Projection};
use crate::nn::module::{Module, ParamEntry};
use crate::tensor::Tensor;
use std::sync::Arc;

/// Defines how a linear layer is split across devices.
///
/// A linear layer computes $Y = X W^T$ with `W` stored `[out, in]`.
///
/// ## Column Parallelism
/// Split `W` by output features (rows of the stored matrix): $W = [W_1; W_2]$.
/// $$
/// Y = [X W_1^T | X W_2^T] = [Y_1 | Y_2]
/// $$
/// Each rank computes a slice of the output features from the full input.
///
/// ## Row Parallelism
/// Split `W` by input features (columns of the stored matrix) and feed each rank the matching
/// slice of `X`:
/// $$
/// Y = X_1 W_1^T + X_2 W_2^T
/// $$
/// Each rank computes a *partial sum*; a reduction over the group completes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelStrategy {
    Column,
    Row,
}

/// A Linear layer with Tensor Parallelism support.
///
/// With `sequence_parallel`, activations outside the layer pair are row-sharded:
///
/// | strategy | forward | backward |
/// |---|---|---|
/// | `Column` | all-gather input rows, local matmul | local `dx`, reduce-scatter rows |
/// | `Row` | local partial matmul, reduce-scatter rows | all-gather `dy` rows, local backward |
///
/// Without it the column layer all-reduces `dx` and the row layer all-reduces its output.
/// Reductions run on unrounded `f32` partials; the result is rounded to the layer dtype once.
///
/// A row-parallel bias is held by one rank only so the reduction adds it exactly once.
#[derive(Debug, Clone)]
pub struct TensorParallelLinear {
    pub linear: Linear,
    pub strategy: ParallelStrategy,
    pub sequence_parallel: bool,
    group: Arc<dyn CollectiveBackend>,
}

impl TensorParallelLinear {
    /// Creates a new Tensor Parallel Linear layer.
    ///
    /// # Arguments
    /// * `linear` - The local shard of the weight (and bias, if this rank holds one).
    /// * `strategy` - The parallelism strategy (Column or Row).
    /// * `sequence_parallel` - Whether activations outside this layer are row-sharded.
    /// * `group` - The tensor-parallel group.
    pub fn new(
        linear: Linear,
        strategy: ParallelStrategy,
        sequence_parallel: bool,
        group: Arc<dyn CollectiveBackend>,
    ) -> Self {
        Self {
            linear,
            strategy,
            sequence_parallel,
            group,
        }
    }

    pub fn group(&self) -> &dyn CollectiveBackend {
        self.group.as_ref()
    }

    fn reduce(&self, mut partial: Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        if self.sequence_parallel {
            reduce_scatter_to_sequence_parallel_region(&partial, self.group())
        } else {
            all_reduce_tensor(&mut partial, self.group())?;
            Ok(partial)
        }
    }

    fn gather(&self, x: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        if self.sequence_parallel {
            gather_from_sequence_parallel_region(x, self.group())
        } else {
            Ok(x.clone())
        }
    }

    pub fn forward(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, LinearCtx)> {
        match self.strategy {
            ParallelStrategy::Column => {
                let x_full = self.gather(x)?;
                self.linear.forward(&x_full)
            }
            ParallelStrategy::Row => {
                let (partial, ctx) = self.linear.forward_raw(x)?;
                let y = self.reduce(partial)?;
                Ok((y.rounded(self.linear.dtype), ctx))
            }
        }
    }

    pub fn backward(&mut self, ctx: LinearCtx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        match self.strategy {
            ParallelStrategy::Column => {
                let partial = self.linear.backward_raw(ctx, dy)?;
                let dx = self.reduce(partial)?;
                Ok(dx.rounded(self.linear.dtype))
            }
            ParallelStrategy::Row => {
                let dy_full = self.gather(dy)?;
                self.linear.backward(ctx, &dy_full)
            }
        }
    }
}

impl Module for TensorParallelLinear {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)> {
        self.linear.named_parameters_mut()
    }
}

impl Projection for TensorParallelLinear {
    type Ctx = LinearCtx;

    fn project(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, LinearCtx)> {
        self.forward(x)
    }

    fn project_backward(&mut self, ctx: LinearCtx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        self.backward(ctx, dy)
    }

    fn linear(&self) -> &Linear {
        &self.linear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ops::scatter_to_sequence_parallel_region;
    use crate::distributed::{launch, LaunchConfig};
    use crate::nn::init::{randn, seeded_rng};
    use crate::precision::DType;

    /// Column then row parallel over 2 ranks reproduces two dense layers in f32.
    #[test]
    fn test_column_row_pair_matches_dense() {
        let mut rng = seeded_rng(0);
        let (dim, hidden, rows) = (6, 8, 4);
        let mut fc1 = Linear::init(dim, hidden, true, DType::F32, &mut rng);
        let mut fc2 = Linear::init(hidden, dim, true, DType::F32, &mut rng);
        let x = randn([rows, dim], &mut rng);
        let dy = randn([rows, dim], &mut rng);

        let (h, c1) = fc1.forward(&x).unwrap();
        let (y, c2) = fc2.forward(&h).unwrap();
        let dh = fc2.backward(c2, &dy).unwrap();
        let dx = fc1.backward(c1, &dh).unwrap();

        for sequence_parallel in [true, false] {
            let (fc1, fc2, x, dy) = (&fc1, &fc2, &x, &dy);
            let results = launch(&LaunchConfig::new(2, 2), move |state| {
                let rank = state.tensor_parallel_rank();
                let q = hidden / 2;
                let w1 = fc1.weight.value.narrow_rows(rank * q, q)?;
                let b1 = fc1.bias.as_ref().map(|b| b.value.narrow(rank * q, q)).transpose()?;
                let w2 = fc2.weight.value.narrow_cols(rank * q, q)?;
                let b2 = (rank == 0).then(|| fc2.bias.as_ref().map(|b| b.value.clone())).flatten();
                let mut col = TensorParallelLinear::new(
                    Linear::new(w1, b1, DType::F32)?,
                    ParallelStrategy::Column,
                    sequence_parallel,
                    state.group(),
                );
                let mut row = TensorParallelLinear::new(
                    Linear::new(w2, b2, DType::F32)?,
                    ParallelStrategy::Row,
                    sequence_parallel,
                    state.group(),
                );
                let (x_in, dy_in) = if sequence_parallel {
                    (
                        scatter_to_sequence_parallel_region(x, rank, 2)?,
                        scatter_to_sequence_parallel_region(dy, rank, 2)?,
                    )
                } else {
                    (x.clone(), dy.clone())
                };
                let (h, c1) = col.forward(&x_in)?;
                let (y, c2) = row.forward(&h)?;
                let dh = row.backward(c2, &dy_in)?;
                let dx = col.backward(c1, &dh)?;
                Ok((y, dx))
            })
            .unwrap();

            for (rank, (y_r, dx_r)) in results.iter().enumerate() {
                let (y_ref, dx_ref) = if sequence_parallel {
                    (
                        y.narrow_rows(rank * 2, 2).unwrap(),
                        dx.narrow_rows(rank * 2, 2).unwrap(),
                    )
                } else {
                    (y.clone(), dx.clone())
                };
                assert!(y_r.allclose(&y_ref, 1e-5, 1e-5).unwrap(), "sp={sequence_parallel}");
                assert!(dx_r.allclose(&dx_ref, 1e-5, 1e-5).unwrap(), "sp={sequence_parallel}");
            }
        }
    }
}
