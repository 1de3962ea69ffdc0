use crate::error::Result;
use crate::nn::attention::{AttentionCtx, SelfAttention};
use crate::nn::block::{ForwardArgs, Sublayer};
use crate::nn::linear::{Linear, Projection};
use crate::nn::module::{with_prefix, Module, ParamEntry};
use crate::tensor::Tensor;

/// Multi-head self-attention: packed `Wqkv` projection, [`SelfAttention`], `out_proj`.
///
/// Generic over the projection so the same code runs dense (`L = Linear`) and tensor parallel.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention<L = Linear> {
    pub wqkv: L,
    pub inner_attn: SelfAttention,
    pub out_proj: L,
}

pub struct MhaCtx<L: Projection> {
    wqkv: L::Ctx,
    attn: AttentionCtx,
    out_proj: L::Ctx,
}

impl<L: Projection> MultiHeadAttention<L> {
    pub fn new(wqkv: L, inner_attn: SelfAttention, out_proj: L) -> Self {
        Self {
            wqkv,
            inner_attn,
            out_proj,
        }
    }
}

impl<L: Projection> Module for MultiHeadAttention<L> {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)> {
        with_prefix("Wqkv", self.wqkv.named_parameters_mut())
            .chain(with_prefix("out_proj", self.out_proj.named_parameters_mut()))
            .collect()
    }
}

impl<L: Projection> Sublayer for MultiHeadAttention<L> {
    type Ctx = MhaCtx<L>;

    fn forward(&self, x: &Tensor<f32, 2>, args: &ForwardArgs) -> Result<(Tensor<f32, 2>, MhaCtx<L>)> {
        let (qkv, wqkv) = self.wqkv.project(x)?;
        let (ctx_out, attn) = self.inner_attn.forward(&qkv, args.seqlen)?;
        let (out, out_proj) = self.out_proj.project(&ctx_out)?;
        Ok((
            out,
            MhaCtx {
                wqkv,
                attn,
                out_proj,
            },
        ))
    }

    fn backward(&mut self, ctx: MhaCtx<L>, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        let d_ctx = self.out_proj.project_backward(ctx.out_proj, dy)?;
        let d_qkv = self.inner_attn.backward(ctx.attn, &d_ctx)?;
        self.wqkv.project_backward(ctx.wqkv, &d_qkv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::init::seeded_rng;
    use crate::precision::DType;

    #[test]
    fn test_forward_backward_shapes_and_names() {
        let mut rng = seeded_rng(0);
        let dim = 16;
        let mut mha = MultiHeadAttention::new(
            Linear::init(dim, 3 * dim, true, DType::F32, &mut rng),
            SelfAttention::new(4, 4, false, None, DType::F32),
            Linear::init(dim, dim, true, DType::F32, &mut rng),
        );
        let x = crate::nn::init::randn([6, dim], &mut rng);
        let (y, ctx) = mha.forward(&x, &ForwardArgs { seqlen: 3 }).unwrap();
        assert_eq!(y.shape(), &[6, dim]);
        let dx = mha.backward(ctx, &Tensor::ones([6, dim])).unwrap();
        assert_eq!(dx.shape(), &[6, dim]);

        let names: Vec<String> = mha.named_parameters_mut().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["Wqkv.weight", "Wqkv.bias", "out_proj.weight", "out_proj.bias"]
        );
        assert!(mha.wqkv.weight.grad.is_some());
    }
}
