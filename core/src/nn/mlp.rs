use crate::error::Result;
use crate::nn::activation::Activation;
use crate::nn::block::{ForwardArgs, Sublayer};
use crate::nn::linear::{Linear, Projection};
use crate::nn::module::{with_prefix, Module, ParamEntry};
use crate::precision::DType;
use crate::tensor::Tensor;

/// `fc2(gelu(fc1(x)))`.
#[derive(Debug, Clone)]
pub struct Mlp<L = Linear> {
    pub fc1: L,
    pub fc2: L,
    pub dtype: DType,
}

pub struct MlpCtx<L: Projection> {
    fc1: L::Ctx,
    pre_act: Tensor<f32, 2>,
    fc2: L::Ctx,
}

impl<L: Projection> Mlp<L> {
    pub fn new(fc1: L, fc2: L, dtype: DType) -> Self {
        Self { fc1, fc2, dtype }
    }
}

impl<L: Projection> Module for Mlp<L> {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)> {
        with_prefix("fc1", self.fc1.named_parameters_mut())
            .chain(with_prefix("fc2", self.fc2.named_parameters_mut()))
            .collect()
    }
}

impl<L: Projection> Sublayer for Mlp<L> {
    type Ctx = MlpCtx<L>;

    fn forward(&self, x: &Tensor<f32, 2>, _args: &ForwardArgs) -> Result<(Tensor<f32, 2>, MlpCtx<L>)> {
        let (pre_act, fc1) = self.fc1.project(x)?;
        let act = Activation::gelu(&pre_act, self.dtype);
        let (out, fc2) = self.fc2.project(&act)?;
        Ok((out, MlpCtx { fc1, pre_act, fc2 }))
    }

    fn backward(&mut self, ctx: MlpCtx<L>, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        let d_act = self.fc2.project_backward(ctx.fc2, dy)?;
        let d_pre = Activation::gelu_backward(&ctx.pre_act, &d_act, self.dtype)?;
        self.fc1.project_backward(ctx.fc1, &d_pre)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::activation::gelu;
    use crate::nn::init::seeded_rng;

    #[test]
    fn test_forward_matches_manual() {
        let fc1 = Linear::new(Tensor::new(vec![1.0, -1.0], [2, 1]).unwrap(), None, DType::F32).unwrap();
        let fc2 = Linear::new(Tensor::new(vec![1.0, 1.0], [1, 2]).unwrap(), None, DType::F32).unwrap();
        let mlp = Mlp::new(fc1, fc2, DType::F32);
        let x = Tensor::new(vec![0.5], [1, 1]).unwrap();
        let (y, _) = mlp.forward(&x, &ForwardArgs { seqlen: 1 }).unwrap();
        assert!((y.data()[0] - (gelu(0.5) + gelu(-0.5))).abs() < 1e-6);
    }

    #[test]
    fn test_backward_populates_all_grads() {
        let mut rng = seeded_rng(1);
        let mut mlp = Mlp::new(
            Linear::init(8, 32, true, DType::BF16, &mut rng),
            Linear::init(32, 8, true, DType::BF16, &mut rng),
            DType::BF16,
        );
        let x = crate::nn::init::randn([4, 8], &mut rng).rounded(DType::BF16);
        let (_, ctx) = mlp.forward(&x, &ForwardArgs { seqlen: 4 }).unwrap();
        let dx = mlp.backward(ctx, &Tensor::ones([4, 8])).unwrap();
        assert_eq!(dx.shape(), &[4, 8]);
        for (name, entry) in mlp.named_parameters_mut() {
            let grad = entry.grad.unwrap_or_else(|| panic!("{name} has no gradient"));
            assert!(grad.iter().all(|g| DType::BF16.round(*g) == *g));
        }
    }
}
