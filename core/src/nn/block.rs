//! Pre-norm transformer block with a carried residual stream.
//!
//! ```text
//! residual = hidden + residual          (stored in the residual dtype)
//! hidden   = mixer(norm1(residual))
//! residual = hidden + residual
//! hidden   = mlp(norm2(residual))
//! return (hidden, residual)
//! ```
//!
//! Returning the un-normalised residual next to the MLP output lets the next block fuse its own
//! add + norm, so a stack of blocks never adds the MLP output in the block that produced it.

use crate::error::Result;
use crate::nn::linear::Linear;
use crate::nn::mha::MultiHeadAttention;
use crate::nn::mlp::Mlp;
use crate::nn::module::{with_prefix, Module, ParamEntry};
use crate::nn::norm::{LayerNorm, LayerNormCtx};
use crate::precision::DType;
use crate::tensor::Tensor;

/// Per-call arguments forwarded to the mixer and MLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardArgs {
    /// Tokens per sequence. Activations are `[batch * seqlen, features]`; attention and rotary
    /// positions need the sequence boundaries back.
    pub seqlen: usize,
}

/// A block sub-layer (mixer or MLP) with an explicit saved-context backward.
pub trait Sublayer: Module {
    type Ctx: Send;

    fn forward(&self, x: &Tensor<f32, 2>, args: &ForwardArgs) -> Result<(Tensor<f32, 2>, Self::Ctx)>;

    /// Accumulates parameter gradients and returns the gradient of the input.
    fn backward(&mut self, ctx: Self::Ctx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOptions {
    /// Keep the residual stream in `f32` instead of the activation dtype.
    pub residual_in_fp32: bool,
    /// The block sees only this rank's slice of the sequence; marks the norms' parameters.
    pub sequence_parallel: bool,
    pub dtype: DType,
}

#[derive(Debug, Clone)]
pub struct Block<M, F> {
    pub norm1: LayerNorm,
    pub mixer: M,
    pub norm2: LayerNorm,
    pub mlp: F,
    pub options: BlockOptions,
}

/// The dense block: single-device attention and MLP.
pub type DenseBlock = Block<MultiHeadAttention<Linear>, Mlp<Linear>>;

pub struct BlockCtx<M: Sublayer, F: Sublayer> {
    norm1: LayerNormCtx,
    mixer: M::Ctx,
    norm2: LayerNormCtx,
    mlp: F::Ctx,
}

impl<M: Sublayer, F: Sublayer> Block<M, F> {
    pub fn new(
        mut norm1: LayerNorm,
        mixer: M,
        mut norm2: LayerNorm,
        mlp: F,
        options: BlockOptions,
    ) -> Self {
        norm1.set_sequence_parallel(options.sequence_parallel);
        norm2.set_sequence_parallel(options.sequence_parallel);
        Self {
            norm1,
            mixer,
            norm2,
            mlp,
            options,
        }
    }

    pub fn residual_dtype(&self) -> DType {
        if self.options.residual_in_fp32 {
            DType::F32
        } else {
            self.options.dtype
        }
    }

    /// Returns `(hidden_out, residual_out, ctx)`. With no incoming residual the input itself
    /// starts the residual stream.
    pub fn forward(
        &self,
        hidden: &Tensor<f32, 2>,
        residual: Option<&Tensor<f32, 2>>,
        args: &ForwardArgs,
    ) -> Result<(Tensor<f32, 2>, Tensor<f32, 2>, BlockCtx<M, F>)> {
        let rdtype = self.residual_dtype();
        let residual = match residual {
            Some(r) => (hidden + r)?.rounded(rdtype),
            None => hidden.clone().rounded(rdtype),
        };

        let (normed, norm1) = self.norm1.forward(&residual)?;
        let (mixed, mixer) = self.mixer.forward(&normed, args)?;
        let residual = (&mixed + &residual)?.rounded(rdtype);

        let (normed, norm2) = self.norm2.forward(&residual)?;
        let (out, mlp) = self.mlp.forward(&normed, args)?;

        Ok((
            out,
            residual,
            BlockCtx {
                norm1,
                mixer,
                norm2,
                mlp,
            },
        ))
    }

    /// Returns `(d_hidden, d_residual)` for the two inputs of [`Block::forward`].
    pub fn backward(
        &mut self,
        ctx: BlockCtx<M, F>,
        d_out: &Tensor<f32, 2>,
        d_residual_out: Option<&Tensor<f32, 2>>,
    ) -> Result<(Tensor<f32, 2>, Tensor<f32, 2>)> {
        let dtype = self.options.dtype;
        let rdtype = self.residual_dtype();

        let d_normed = self.mlp.backward(ctx.mlp, d_out)?;
        let mut d_residual = self.norm2.backward(ctx.norm2, &d_normed)?;
        if let Some(d) = d_residual_out {
            d_residual.add_assign(d)?;
        }
        let d_residual = d_residual.rounded(rdtype);

        let d_mixed = d_residual.clone().rounded(dtype);
        let d_normed = self.mixer.backward(ctx.mixer, &d_mixed)?;
        let mut d_residual_in = self.norm1.backward(ctx.norm1, &d_normed)?;
        d_residual_in.add_assign(&d_residual)?;
        let d_residual_in = d_residual_in.rounded(rdtype);

        let d_hidden = d_residual_in.clone().rounded(dtype);
        Ok((d_hidden, d_residual_in))
    }
}

impl<M: Sublayer, F: Sublayer> Module for Block<M, F> {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)> {
        with_prefix("norm1", self.norm1.named_parameters_mut())
            .chain(with_prefix("mixer", self.mixer.named_parameters_mut()))
            .chain(with_prefix("norm2", self.norm2.named_parameters_mut()))
            .chain(with_prefix("mlp", self.mlp.named_parameters_mut()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::attention::SelfAttention;
    use crate::nn::init::{randn, seeded_rng};
    use crate::nn::norm::DEFAULT_EPS;
    use crate::nn::rotary::{RotaryEmbedding, DEFAULT_BASE};

    fn dense_block(dim: usize, dtype: DType) -> DenseBlock {
        let mut rng = seeded_rng(42);
        let heads = dim / 4;
        let norm = |rng: &mut rand::rngs::StdRng| {
            LayerNorm::new(randn([dim], rng), randn([dim], rng), DEFAULT_EPS, dtype).unwrap()
        };
        let norm1 = norm(&mut rng);
        let norm2 = norm(&mut rng);
        let mixer = MultiHeadAttention::new(
            Linear::init(dim, 3 * dim, true, dtype, &mut rng),
            SelfAttention::new(
                heads,
                4,
                true,
                Some(RotaryEmbedding::new(2, DEFAULT_BASE, dtype).unwrap()),
                dtype,
            ),
            Linear::init(dim, dim, true, dtype, &mut rng),
        );
        let mlp = Mlp::new(
            Linear::init(dim, 4 * dim, true, dtype, &mut rng),
            Linear::init(4 * dim, dim, true, dtype, &mut rng),
            dtype,
        );
        Block::new(
            norm1,
            mixer,
            norm2,
            mlp,
            BlockOptions {
                residual_in_fp32: true,
                sequence_parallel: false,
                dtype,
            },
        )
    }

    #[test]
    fn test_parameter_names() {
        let mut block = dense_block(8, DType::F32);
        let names: Vec<String> = block
            .named_parameters_mut()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(
            names,
            vec![
                "norm1.weight",
                "norm1.bias",
                "mixer.Wqkv.weight",
                "mixer.Wqkv.bias",
                "mixer.out_proj.weight",
                "mixer.out_proj.bias",
                "norm2.weight",
                "norm2.bias",
                "mlp.fc1.weight",
                "mlp.fc1.bias",
                "mlp.fc2.weight",
                "mlp.fc2.bias",
            ]
        );
    }

    #[test]
    fn test_residual_out_is_sum_of_inputs_and_mixer() {
        let block = dense_block(8, DType::F32);
        let mut rng = seeded_rng(0);
        let x = randn([4, 8], &mut rng);
        let r = randn([4, 8], &mut rng);
        let args = ForwardArgs { seqlen: 2 };
        let (out, residual_out, _) = block.forward(&x, Some(&r), &args).unwrap();
        assert_eq!(out.shape(), &[4, 8]);

        let r1 = (&x + &r).unwrap();
        let (h1, _) = block.norm1.forward(&r1).unwrap();
        let (mixed, _) = block.mixer.forward(&h1, &args).unwrap();
        let expected = (&mixed + &r1).unwrap();
        assert!(residual_out.allclose(&expected, 0.0, 0.0).unwrap());
    }

    #[test]
    fn test_sequence_parallel_marks_norms_only() {
        let dense = dense_block(8, DType::F32);
        let mut block = Block::new(
            dense.norm1,
            dense.mixer,
            dense.norm2,
            dense.mlp,
            BlockOptions {
                sequence_parallel: true,
                ..dense.options
            },
        );
        for (name, entry) in block.named_parameters_mut() {
            assert_eq!(entry.sequence_parallel, name.starts_with("norm"), "{name}");
        }
    }

    /// The residual gradient matches central differences of `sum(out * g)` in f32.
    #[test]
    fn test_backward_matches_finite_differences() {
        let mut block = dense_block(8, DType::F32);
        let mut rng = seeded_rng(7);
        let x = randn([4, 8], &mut rng);
        let r = randn([4, 8], &mut rng);
        let g = randn([4, 8], &mut rng).scale(1.0 / 32.0);
        let args = ForwardArgs { seqlen: 2 };

        let (_, _, ctx) = block.forward(&x, Some(&r), &args).unwrap();
        let (dx, dr) = block.backward(ctx, &g, None).unwrap();
        assert_eq!(dx, dr);

        let loss = |input: &Tensor<f32, 2>| -> f64 {
            let (o, _, _) = block.forward(input, Some(&r), &args).unwrap();
            o.data().iter().zip(g.data()).map(|(a, b)| *a as f64 * *b as f64).sum()
        };
        let h = 1e-2f32;
        for i in (0..x.size()).step_by(3) {
            let mut plus = x.clone();
            plus.data_mut()[i] += h;
            let mut minus = x.clone();
            minus.data_mut()[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h as f64);
            assert!(
                (numeric - dx.data()[i] as f64).abs() < 5e-3,
                "index {i}: numeric {numeric} analytic {}",
                dx.data()[i]
            );
        }
    }
}
