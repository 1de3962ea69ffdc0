use crate::error::Result;
use crate::nn::module::{Module, ParamEntry, Parameter};
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;

pub const DEFAULT_EPS: f32 = 1e-5;

/// Layer Normalization over the last dimension, with elementwise affine weight and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Parameter<1>,
    pub bias: Parameter<1>,
    pub eps: f32,
    pub dtype: DType,
}

/// Normalized input and per-row reciprocal standard deviation.
#[derive(Debug, Clone)]
pub struct LayerNormCtx {
    xhat: Tensor<f32, 2>,
    rstd: Vec<f32>,
}

impl LayerNorm {
    /// Creates a new LayerNorm layer.
    ///
    /// # Arguments
    ///
    /// * `weight` - The scale weights of shape `[features]`.
    /// * `bias` - The shift of shape `[features]`.
    /// * `eps` - A small constant for numerical stability.
    /// * `dtype` - Storage format of the output and parameter gradients.
    pub fn new(weight: Tensor<f32, 1>, bias: Tensor<f32, 1>, eps: f32, dtype: DType) -> Result<Self> {
        if weight.shape() != bias.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: weight.shape().to_vec(),
                got: bias.shape().to_vec(),
            }
            .into());
        }
        Ok(Self {
            weight: Parameter::new(weight.rounded(dtype)),
            bias: Parameter::new(bias.rounded(dtype)),
            eps,
            dtype,
        })
    }

    pub fn features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Marks both parameters as replicated over a sequence-parallel group.
    pub fn set_sequence_parallel(&mut self, flag: bool) {
        self.weight.sequence_parallel = flag;
        self.bias.sequence_parallel = flag;
    }

    /// `y = (x - mean) * rstd * weight + bias`, with statistics computed in `f32` and `y` stored in
    /// `dtype`.
    pub fn forward(&self, x: &Tensor<f32, 2>) -> Result<(Tensor<f32, 2>, LayerNormCtx)> {
        let features = self.features();
        if x.cols() != features {
            return Err(TensorError::ShapeMismatch {
                expected: vec![x.rows(), features],
                got: x.shape().to_vec(),
            }
            .into());
        }

        let mut xhat = Tensor::zeros(*x.shape());
        let mut rstd = vec![0.0f32; x.rows()];
        xhat.data_mut()
            .par_chunks_mut(features)
            .zip(rstd.par_iter_mut())
            .zip(x.data().par_chunks(features))
            .for_each(|((xhat_row, rstd_row), in_row)| {
                let mean = in_row.iter().sum::<f32>() / features as f32;
                let var = in_row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
                    / features as f32;
                let r = 1.0 / (var + self.eps).sqrt();
                for (out, &v) in xhat_row.iter_mut().zip(in_row) {
                    *out = (v - mean) * r;
                }
                *rstd_row = r;
            });

        let weight = self.weight.value.data();
        let bias = self.bias.value.data();
        let mut y = Tensor::zeros(*x.shape());
        y.data_mut()
            .par_chunks_mut(features)
            .zip(xhat.data().par_chunks(features))
            .for_each(|(y_row, xhat_row)| {
                for i in 0..features {
                    y_row[i] = self.dtype.round(xhat_row[i] * weight[i] + bias[i]);
                }
            });

        Ok((y, LayerNormCtx { xhat, rstd }))
    }

    /// Accumulates weight and bias gradients and returns `dx` in `f32`.
    ///
    /// `dx = rstd * (dxhat - mean(dxhat) - xhat * mean(dxhat * xhat))` with `dxhat = dy * weight`.
    pub fn backward(&mut self, ctx: LayerNormCtx, dy: &Tensor<f32, 2>) -> Result<Tensor<f32, 2>> {
        if dy.shape() != ctx.xhat.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: ctx.xhat.shape().to_vec(),
                got: dy.shape().to_vec(),
            }
            .into());
        }
        let features = self.features();
        let weight = self.weight.value.data();

        let mut dx = Tensor::zeros(*dy.shape());
        dx.data_mut()
            .par_chunks_mut(features)
            .zip(dy.data().par_chunks(features))
            .zip(ctx.xhat.data().par_chunks(features))
            .zip(ctx.rstd.par_iter())
            .for_each(|(((dx_row, dy_row), xhat_row), &r)| {
                let mut mean_dxhat = 0.0f32;
                let mut mean_dxhat_xhat = 0.0f32;
                for i in 0..features {
                    let dxhat = dy_row[i] * weight[i];
                    mean_dxhat += dxhat;
                    mean_dxhat_xhat += dxhat * xhat_row[i];
                }
                mean_dxhat /= features as f32;
                mean_dxhat_xhat /= features as f32;
                for i in 0..features {
                    let dxhat = dy_row[i] * weight[i];
                    dx_row[i] = r * (dxhat - mean_dxhat - xhat_row[i] * mean_dxhat_xhat);
                }
            });

        let dweight = (dy * &ctx.xhat)?.sum_rows();
        let dbias = dy.sum_rows();
        self.weight.accumulate_grad(dweight, self.dtype)?;
        self.bias.accumulate_grad(dbias, self.dtype)?;
        Ok(dx)
    }
}

impl Module for LayerNorm {
    fn named_parameters_mut(&mut self) -> Vec<(String, ParamEntry<'_>)> {
        vec![
            ("weight".to_string(), self.weight.entry()),
            ("bias".to_string(), self.bias.entry()),
        ]
    }
}
