use crate::error::Result;
use crate::kernels::attention::{flash_attention_backward, flash_attention_forward, AttentionShape};
use crate::nn::rotary::RotaryEmbedding;
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};

/// Parameter-free attention core: rotary embedding on `q`/`k`, then softmax attention.
///
/// Input is the packed projection `[tokens, 3 * num_heads * head_dim]`, output
/// `[tokens, num_heads * head_dim]`. In a tensor-parallel model `num_heads` is the local head
/// count of the rank.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    pub num_heads: usize,
    pub head_dim: usize,
    pub softmax_scale: f32,
    pub causal: bool,
    pub rotary: Option<RotaryEmbedding>,
    pub dtype: DType,
}

#[derive(Debug, Clone)]
pub struct AttentionCtx {
    qkv: Tensor<f32, 2>,
    out: Tensor<f32, 2>,
    lse: Vec<f32>,
    seqlen: usize,
}

impl SelfAttention {
    pub fn new(
        num_heads: usize,
        head_dim: usize,
        causal: bool,
        rotary: Option<RotaryEmbedding>,
        dtype: DType,
    ) -> Self {
        Self {
            num_heads,
            head_dim,
            softmax_scale: 1.0 / (head_dim as f32).sqrt(),
            causal,
            rotary,
            dtype,
        }
    }

    fn shape(&self, tokens: usize, seqlen: usize) -> Result<AttentionShape> {
        crate::ensure!(
            seqlen > 0 && tokens % seqlen == 0,
            "{tokens} tokens do not split into sequences of {seqlen}"
        );
        Ok(AttentionShape {
            batch: tokens / seqlen,
            seqlen,
            num_heads: self.num_heads,
            head_dim: self.head_dim,
        })
    }

    pub fn forward(&self, qkv: &Tensor<f32, 2>, seqlen: usize) -> Result<(Tensor<f32, 2>, AttentionCtx)> {
        let shape = self.shape(qkv.rows(), seqlen)?;
        if qkv.cols() != shape.qkv_width() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![qkv.rows(), shape.qkv_width()],
                got: qkv.shape().to_vec(),
            }
            .into());
        }

        let mut qkv = qkv.clone();
        if let Some(rotary) = &self.rotary {
            rotary.apply_qkv(&mut qkv, seqlen, self.num_heads, self.head_dim, false)?;
        }

        let fwd = flash_attention_forward(qkv.data(), shape, self.softmax_scale, self.causal)?;
        let out = Tensor::new(fwd.out, [shape.tokens(), shape.out_width()])?.rounded(self.dtype);
        Ok((
            out.clone(),
            AttentionCtx {
                qkv,
                out,
                lse: fwd.lse,
                seqlen,
            },
        ))
    }

    /// Returns the gradient with respect to the packed, un-rotated `qkv`.
    pub fn backward(&self, ctx: AttentionCtx, dout: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        if dout.shape() != ctx.out.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: ctx.out.shape().to_vec(),
                got: dout.shape().to_vec(),
            }
            .into());
        }
        let shape = self.shape(ctx.qkv.rows(), ctx.seqlen)?;
        let dqkv = flash_attention_backward(
            ctx.qkv.data(),
            ctx.out.data(),
            dout.data(),
            &ctx.lse,
            shape,
            self.softmax_scale,
            self.causal,
        )?;
        let mut dqkv = Tensor::new(dqkv, *ctx.qkv.shape())?.rounded(self.dtype);
        if let Some(rotary) = &self.rotary {
            rotary.apply_qkv(&mut dqkv, ctx.seqlen, self.num_heads, self.head_dim, true)?;
        }
        Ok(dqkv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::init::{randn, seeded_rng};
    use crate::nn::rotary::DEFAULT_BASE;

    fn attention() -> SelfAttention {
        let rotary = RotaryEmbedding::new(2, DEFAULT_BASE, DType::F32).unwrap();
        SelfAttention::new(2, 4, true, Some(rotary), DType::F32)
    }

    #[test]
    fn test_scale() {
        assert_eq!(attention().softmax_scale, 0.5);
    }

    #[test]
    fn test_shapes() {
        let attn = attention();
        let qkv = randn([6, 24], &mut seeded_rng(0));
        let (out, _) = attn.forward(&qkv, 3).unwrap();
        assert_eq!(out.shape(), &[6, 8]);
        assert!(attn.forward(&qkv, 4).is_err());
        assert!(attn.forward(&randn([6, 20], &mut seeded_rng(0)), 3).is_err());
    }

    /// The gradient through rotary + attention matches central differences of `sum(out * g)`.
    #[test]
    fn test_backward_through_rotary() {
        let attn = attention();
        let mut rng = seeded_rng(4);
        let qkv = randn([4, 24], &mut rng);
        let g = randn([4, 8], &mut rng);
        let (_, ctx) = attn.forward(&qkv, 4).unwrap();
        let dqkv = attn.backward(ctx, &g).unwrap();

        let loss = |input: &Tensor<f32, 2>| -> f64 {
            let (o, _) = attn.forward(input, 4).unwrap();
            o.data().iter().zip(g.data()).map(|(a, b)| *a as f64 * *b as f64).sum()
        };
        let h = 1e-2f32;
        for i in 0..qkv.size() {
            let mut plus = qkv.clone();
            plus.data_mut()[i] += h;
            let mut minus = qkv.clone();
            minus.data_mut()[i] -= h;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h as f64);
            assert!(
                (numeric - dqkv.data()[i] as f64).abs() < 5e-3,
                "index {i}: numeric {numeric} analytic {}",
                dqkv.data()[i]
            );
        }
    }
}
