use crate::precision::DType;
use crate::tensor::{Result, Tensor};

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEFF: f32 = 0.044_715;

/// GELU, tanh approximation.
#[inline]
pub fn gelu(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Derivative of [`gelu`].
#[inline]
pub fn gelu_grad(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
    let t = inner.tanh();
    let dinner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * dinner
}

/// Activation functions applied element-wise with the result stored in `dtype`.
pub struct Activation;

impl Activation {
    pub fn gelu<const RANK: usize>(x: &Tensor<f32, RANK>, dtype: DType) -> Tensor<f32, RANK> {
        x.map(|v| dtype.round(gelu(v)))
    }

    /// `dy * gelu'(x)`, stored in `dtype`.
    pub fn gelu_backward<const RANK: usize>(
        x: &Tensor<f32, RANK>,
        dy: &Tensor<f32, RANK>,
        dtype: DType,
    ) -> Result<Tensor<f32, RANK>> {
        x.zip_map(dy, |v, g| dtype.round(g * gelu_grad(v)))
    }
}
