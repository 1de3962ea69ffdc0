use crate::error::Result;
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;

pub const DEFAULT_BASE: f32 = 10_000.0;

/// Rotary Positional Embedding (RoPE), GPT-NeoX layout.
///
/// The first `dim` features of every query and key head are split into halves `x1 = x[..dim/2]`,
/// `x2 = x[dim/2..dim]` and rotated by a position dependent angle:
///
/// $$ \begin{pmatrix} x_1' \\ x_2' \end{pmatrix} = \begin{pmatrix} \cos \theta & -\sin \theta \\ \sin \theta & \cos \theta \end{pmatrix} \begin{pmatrix} x_1 \\ x_2 \end{pmatrix} $$
///
/// with `theta_i = pos / base^(2i / dim)`. Features past `dim` and the value heads pass through.
/// The rotation is orthogonal, so the backward pass is the same rotation with `-theta`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    dim: usize,
    base: f32,
    dtype: DType,
}

impl RotaryEmbedding {
    pub fn new(dim: usize, base: f32, dtype: DType) -> Result<Self> {
        crate::ensure!(
            dim > 0 && dim % 2 == 0,
            "rotary dimension must be a positive even number, got {dim}"
        );
        Ok(Self { dim, base, dtype })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Cosine and sine tables `[seqlen, dim / 2]`, stored in the layer dtype.
    pub fn cos_sin(&self, seqlen: usize) -> (Vec<f32>, Vec<f32>) {
        let half = self.dim / 2;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / self.base.powf((2 * i) as f32 / self.dim as f32))
            .collect();
        let mut cos = Vec::with_capacity(seqlen * half);
        let mut sin = Vec::with_capacity(seqlen * half);
        for pos in 0..seqlen {
            for &f in &inv_freq {
                let angle = pos as f32 * f;
                cos.push(self.dtype.round(angle.cos()));
                sin.push(self.dtype.round(angle.sin()));
            }
        }
        (cos, sin)
    }

    /// Rotates the query and key heads of a packed `[tokens, 3 * heads * head_dim]` tensor in
    /// place. Token `n` sits at position `n % seqlen`. With `inverse` the rotation is undone,
    /// which is the gradient of the forward rotation.
    pub fn apply_qkv(
        &self,
        qkv: &mut Tensor<f32, 2>,
        seqlen: usize,
        num_heads: usize,
        head_dim: usize,
        inverse: bool,
    ) -> Result<()> {
        let width = 3 * num_heads * head_dim;
        if qkv.cols() != width {
            return Err(TensorError::ShapeMismatch {
                expected: vec![qkv.rows(), width],
                got: qkv.shape().to_vec(),
            }
            .into());
        }
        crate::ensure!(
            self.dim <= head_dim,
            "rotary dimension {} exceeds head dimension {head_dim}",
            self.dim
        );
        crate::ensure!(
            seqlen > 0 && qkv.rows() % seqlen == 0,
            "{} tokens do not split into sequences of {seqlen}",
            qkv.rows()
        );

        let half = self.dim / 2;
        let (cos, sin) = self.cos_sin(seqlen);
        let sign = if inverse { -1.0 } else { 1.0 };
        let dtype = self.dtype;

        qkv.data_mut()
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(token, row)| {
                let pos = token % seqlen;
                let cos = &cos[pos * half..(pos + 1) * half];
                let sin = &sin[pos * half..(pos + 1) * half];
                // Only q (index 0) and k (index 1) are rotated.
                for head in 0..2 * num_heads {
                    let base = head * head_dim;
                    for i in 0..half {
                        let x1 = row[base + i];
                        let x2 = row[base + half + i];
                        let s = sign * sin[i];
                        row[base + i] = dtype.round(x1 * cos[i] - x2 * s);
                        row[base + half + i] = dtype.round(x1 * s + x2 * cos[i]);
                    }
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::init::{randn, seeded_rng};

    #[test]
    fn test_odd_dim_rejected() {
        assert!(RotaryEmbedding::new(3, DEFAULT_BASE, DType::F32).is_err());
    }

    #[test]
    fn test_position_zero_is_identity() {
        let rope = RotaryEmbedding::new(4, DEFAULT_BASE, DType::F32).unwrap();
        let x = randn([1, 3 * 8], &mut seeded_rng(0));
        let mut y = x.clone();
        rope.apply_qkv(&mut y, 1, 1, 8, false).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_rotation_and_passthrough() {
        // one head, head_dim 4, rotary dim 2, position 1: angle = 1 rad on (x[0], x[1]).
        let rope = RotaryEmbedding::new(2, DEFAULT_BASE, DType::F32).unwrap();
        let mut row0 = vec![0.0f32; 12];
        let mut row1 = vec![0.0f32; 12];
        row1[0] = 1.0; // q
        row1[4] = 1.0; // k
        row1[8] = 1.0; // v
        row1[3] = 5.0; // q feature past the rotary dim
        row0.extend(row1);
        let mut qkv = Tensor::new(row0, [2, 12]).unwrap();
        rope.apply_qkv(&mut qkv, 2, 1, 4, false).unwrap();
        let out = &qkv.data()[12..];
        assert!((out[0] - 1f32.cos()).abs() < 1e-6);
        assert!((out[1] - 1f32.sin()).abs() < 1e-6);
        assert!((out[4] - 1f32.cos()).abs() < 1e-6);
        assert_eq!(out[3], 5.0);
        assert_eq!(out[8], 1.0);
        assert_eq!(out[9], 0.0);
    }

    #[test]
    fn test_inverse_undoes_rotation() {
        let rope = RotaryEmbedding::new(8, DEFAULT_BASE, DType::F32).unwrap();
        let x = randn([6, 3 * 2 * 8], &mut seeded_rng(5));
        let mut y = x.clone();
        rope.apply_qkv(&mut y, 3, 2, 8, false).unwrap();
        assert!(!y.allclose(&x, 0.0, 1e-6).unwrap());
        rope.apply_qkv(&mut y, 3, 2, 8, true).unwrap();
        assert!(y.allclose(&x, 1e-5, 1e-5).unwrap());
    }

    #[test]
    fn test_positions_wrap_per_sequence() {
        let rope = RotaryEmbedding::new(4, DEFAULT_BASE, DType::F32).unwrap();
        let row = randn([1, 12], &mut seeded_rng(9));
        let mut two = Tensor::cat_rows(&[row.clone(), row.clone()]).unwrap();
        // seqlen 1: both tokens are at position 0.
        rope.apply_qkv(&mut two, 1, 1, 4, false).unwrap();
        assert_eq!(two.narrow_rows(0, 1).unwrap(), row);
        assert_eq!(two.narrow_rows(1, 1).unwrap(), row);
    }
}
