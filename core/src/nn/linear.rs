use crate::error::Result;
use crate::nn::init;
use crate::nn::module::{Module, ParamEntry, Parameter};
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use rand::Rng;

/// A fully connected layer: `y = x W^T + b`.
///
/// `weight` is stored `[out_features, in_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter<2>,
    pub bias: Option<Parameter<1>>,
    pub dtype: DType,
}

/// Saved input for the backward pass.
#[derive(Debug, Clone)]
pub struct LinearCtx {
    input: Tensor<f32, 2>,
}

impl LinearCtx {
    pub fn input(&self) -> &Tensor<f32, 2> {
        &self.input
    }
}

/// A linear map with a saved-context backward.
///
/// Implemented by the dense [`Linear`] and by its tensor-parallel wrappers, so attention and
/// MLP code is shared between the reference and the sharded model.
pub trait Projection: Module {
    type Ctx: Send;

    fn project(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, Self::Ctx)>;

    /// Accumulates parameter gradients and returns the input gradient.
    fn project_backward(&mut self, ctx: Self::Ctx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>>;

    fn linear(&self) -> &Linear;
}

impl Linear {
    pub fn new(weight: Tensor<f32, 2>, bias: Option<Tensor<f32, 1>>, dtype: DType) -> Result<Self> {
        if let Some(b) = &bias {
            if b.shape()[0] != weight.shape()[0] {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![weight.shape()[0]],
                    got: b.shape().to_vec(),
                }
                .into());
            }
        }
        Ok(Self {
            weight: Parameter::new(weight.rounded(dtype)),
            bias: bias.map(|b| Parameter::new(b.rounded(dtype))),
            dtype,
        })
    }

    /// Draws weight and bias from `U(-1/sqrt(in), 1/sqrt(in))`.
    pub fn init<R: Rng>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        dtype: DType,
        rng: &mut R,
    ) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = init::uniform([out_features, in_features], bound, rng).rounded(dtype);
        let bias = bias.then(|| init::uniform([out_features], bound, rng).rounded(dtype));
        Self {
            weight: Parameter::new(weight),
            bias: bias.map(Parameter::new),
            dtype,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Forward pass with `f32` output, before the store to `dtype`.
    ///
    /// Row-parallel layers reduce this partial result across ranks and round afterwards.
    pub fn forward_raw(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, LinearCtx)> {
        let mut y = x.matmul_nt(&self.weight.value)?;
        if let Some(bias) = &self.bias {
            y = y.add_row_vector(&bias.value)?;
        }
        Ok((y, LinearCtx { input: x.clone() }))
    }

    pub fn forward(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, LinearCtx)> {
        let (y, ctx) = self.forward_raw(x)?;
        Ok((y.rounded(self.dtype), ctx))
    }

    /// Accumulates `dW = dy^T x` and `db = sum(dy)`, returns `dx = dy W` in `f32`.
    pub fn backward_raw(&mut self, ctx: LinearCtx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        if dy.rows() != ctx.input.rows() || dy.cols() != self.out_features() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![ctx.input.rows(), self.out_features()],
                got: dy.shape().to_vec(),
            }
            .into());
        }
        let dx = dy.matmul(&self.weight.value)?;
        let dw = dy.transpose()?.matmul(&ctx.input)?;
        self.weight.accumulate_grad(dw, self.dtype)?;
        if let Some(bias) = &mut self.bias {
            bias.accumulate_grad(dy.sum_rows(), self.dtype)?;
        }
        Ok(dx)
    }

    pub fn backward(&mut self, ctx: LinearCtx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        Ok(self.backward_raw(ctx, dy)?.rounded(self.dtype))
    }
}

impl Module for Linear {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)> {
        let mut params = vec![("weight".to_string(), self.weight.entry())];
        if let Some(bias) = &mut self.bias {
            params.push(("bias".to_string(), bias.entry()));
        }
        params
    }
}

impl Projection for Linear {
    type Ctx = LinearCtx;

    fn project(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, LinearCtx)> {
        self.forward(x)
    }

    fn project_backward(&mut self, ctx: LinearCtx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        self.backward(ctx, dy)
    }

    fn linear(&self) -> &Linear {
        self
    }
}
