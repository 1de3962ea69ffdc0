//! Tensor operations.
//!
//! - **Element-wise arithmetic**: `+`, `-`, `*`, `/` on `&Tensor` (shapes must match exactly).
//! - **Matrix multiplication**: `A·B` and `A·Bᵀ`, delegated to `tp-block-kernels`.
//! - **Rank-2 helpers**: row/column slicing and concatenation, bias broadcast, column sums.
//!   These are the primitives behind the sharding contract and the sequence-parallel collectives.
//! - **Comparison**: `max_abs_diff` and `allclose` with the `|a - b| <= atol + rtol * |b|` rule.
//!
//! Element-wise work is parallelised with `rayon`.
//!
//! ```rust
//! use tp_block::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{compute_strides, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait for `&Tensor`: shape check, then a parallel zip.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_iter())
                    .zip(rhs.data.par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise, producing a new tensor of the same shape.
    ///
    /// ```rust
    /// use tp_block::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Combines two tensors of the same shape element-wise.
    pub fn zip_map<F>(&self, other: &Self, f: F) -> Result<Self>
    where
        F: Fn(T, T) -> T + Sync + Send,
    {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .zip(other.data.par_iter())
            .for_each(|((o, a), b)| *o = f(*a, *b));
        Ok(out)
    }

    /// In-place `self += other`.
    pub fn add_assign(&mut self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }

    /// Multiplies every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Batched matrix multiplication over the last two dimensions: `...mk,...kn->...mn`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let out_data = tp_block_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];
        Tensor::new(out_data, out_shape)
    }

    /// Batched multiplication against a transposed right-hand side: `...mk,...nk->...mn`.
    ///
    /// This is `x · Wᵀ` for a weight stored `[out_features, in_features]`.
    pub fn matmul_nt(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };
        let out_data =
            tp_block_kernels::cpu_matmul_nt(&self.data, &rhs.data, &self.shape, &rhs.shape)?;

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 2];
        Tensor::new(out_data, out_shape)
    }

    /// Transposes the last two dimensions, physically permuting the data.
    pub fn transpose(&self) -> Result<Self> {
        let out_data = tp_block_kernels::cpu_transpose(&self.data, &self.shape)?;
        let mut new_shape = self.shape;
        new_shape.swap(RANK - 1, RANK - 2);
        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: out_data,
        })
    }

    /// Largest absolute element-wise difference. Shapes must match.
    pub fn max_abs_diff(&self, other: &Self) -> Result<f64> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        Ok(self
            .data
            .par_iter()
            .zip(other.data.par_iter())
            .map(|(a, b)| (to_f64(*a) - to_f64(*b)).abs())
            .reduce(|| 0.0, f64::max))
    }

    /// Returns `true` when every element satisfies `|self - other| <= atol + rtol * |other|`.
    ///
    /// `other` is the reference. NaN anywhere fails the comparison.
    pub fn allclose(&self, other: &Self, rtol: f64, atol: f64) -> Result<bool> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        Ok(self.data.par_iter().zip(other.data.par_iter()).all(|(a, b)| {
            let (a, b) = (to_f64(*a), to_f64(*b));
            (a - b).abs() <= atol + rtol * b.abs()
        }))
    }
}

fn to_f64<T: TensorElem>(value: T) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

impl<T> Tensor<T, 2>
where
    T: TensorElem,
{
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    pub fn cols(&self) -> usize {
        self.shape[1]
    }

    /// Copies rows `[start, start + len)`.
    pub fn narrow_rows(&self, start: usize, len: usize) -> Result<Self> {
        let [rows, cols] = self.shape;
        if start + len > rows {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape.to_vec(),
            });
        }
        Tensor::new(
            self.data[start * cols..(start + len) * cols].to_vec(),
            [len, cols],
        )
    }

    /// Copies columns `[start, start + len)`.
    pub fn narrow_cols(&self, start: usize, len: usize) -> Result<Self> {
        let [rows, cols] = self.shape;
        if start + len > cols {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape.to_vec(),
            });
        }
        let mut out = Tensor::zeros([rows, len]);
        if len > 0 {
            out.data
                .par_chunks_mut(len)
                .zip(self.data.par_chunks(cols))
                .for_each(|(dst, src)| dst.copy_from_slice(&src[start..start + len]));
        }
        Ok(out)
    }

    /// Stacks tensors with equal column counts on top of each other.
    pub fn cat_rows(parts: &[Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported(
                "cat_rows of an empty list".to_string(),
            ));
        };
        let cols = first.cols();
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.size()).sum());
        let mut rows = 0;
        for part in parts {
            if part.cols() != cols {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![part.rows(), cols],
                    got: part.shape.to_vec(),
                });
            }
            rows += part.rows();
            data.extend_from_slice(&part.data);
        }
        Tensor::new(data, [rows, cols])
    }

    /// Places tensors with equal row counts side by side.
    pub fn cat_cols(parts: &[Self]) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(TensorError::Unsupported(
                "cat_cols of an empty list".to_string(),
            ));
        };
        let rows = first.rows();
        if let Some(bad) = parts.iter().find(|p| p.rows() != rows) {
            return Err(TensorError::ShapeMismatch {
                expected: vec![rows, bad.cols()],
                got: bad.shape.to_vec(),
            });
        }
        let cols: usize = parts.iter().map(|p| p.cols()).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for part in parts {
                let c = part.cols();
                data.extend_from_slice(&part.data[r * c..(r + 1) * c]);
            }
        }
        Tensor::new(data, [rows, cols])
    }

    /// Sums over rows: `[rows, cols] -> [cols]`. This is the gradient of a broadcast bias.
    pub fn sum_rows(&self) -> Tensor<T, 1> {
        let [rows, cols] = self.shape;
        let mut out = Tensor::zeros([cols]);
        out.data.par_iter_mut().enumerate().for_each(|(c, o)| {
            let mut acc = T::zero();
            for r in 0..rows {
                acc += self.data[r * cols + c];
            }
            *o = acc;
        });
        out
    }

    /// Adds `bias` to every row.
    pub fn add_row_vector(&self, bias: &Tensor<T, 1>) -> Result<Self> {
        let cols = self.cols();
        if bias.shape()[0] != cols {
            return Err(TensorError::ShapeMismatch {
                expected: vec![cols],
                got: bias.shape().to_vec(),
            });
        }
        let mut out = self.clone();
        if cols > 0 {
            out.data.par_chunks_mut(cols).for_each(|row| {
                for (x, b) in row.iter_mut().zip(bias.data()) {
                    *x += *b;
                }
            });
        }
        Ok(out)
    }
}

impl<T> Tensor<T, 1>
where
    T: TensorElem,
{
    /// Copies elements `[start, start + len)`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        if start + len > self.shape[0] {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape.to_vec(),
            });
        }
        Tensor::new(self.data[start..start + len].to_vec(), [len])
    }

    /// Concatenates rank-1 tensors.
    pub fn cat(parts: &[Self]) -> Result<Self> {
        let data: Vec<T> = parts.iter().flat_map(|p| p.data.iter().copied()).collect();
        let len = data.len();
        Tensor::new(data, [len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t2(data: &[f32], shape: [usize; 2]) -> Tensor<f32, 2> {
        Tensor::new(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();

        assert_eq!((&a + &b).unwrap().data(), &[4.0, 6.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 8.0]);
        assert_eq!((&b - &a).unwrap().data(), &[2.0, 2.0]);

        let f = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        assert!(matches!(&a + &f, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matmul_2d() {
        let a = t2(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let b = t2(&[7.0, 8.0, 9.0, 1.0, 2.0, 3.0], [3, 2]);

        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[31.0, 19.0, 85.0, 55.0]);
    }

    #[test]
    fn test_matmul_nt_is_linear_layout() {
        // x: [1, 2], W: [3, 2] stored [out, in]
        let x = t2(&[1.0, 2.0], [1, 2]);
        let w = t2(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], [3, 2]);
        let y = x.matmul_nt(&w).unwrap();
        assert_eq!(y.shape(), &[1, 3]);
        assert_eq!(y.data(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_matmul_shape_error() {
        let a = Tensor::<f32, 2>::zeros([2, 3]);
        let b = Tensor::<f32, 2>::zeros([4, 2]);
        assert!(matches!(a.matmul(&b), Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_transpose() {
        let t = t2(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
        let t_t = t.transpose().unwrap();
        assert_eq!(t_t.shape(), &[3, 2]);
        assert_eq!(t_t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_narrow_and_cat() {
        let t = t2(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]);

        let rows = t.narrow_rows(1, 2).unwrap();
        assert_eq!(rows.data(), &[3.0, 4.0, 5.0, 6.0]);

        let cols = t.narrow_cols(1, 1).unwrap();
        assert_eq!(cols.shape(), &[3, 1]);
        assert_eq!(cols.data(), &[2.0, 4.0, 6.0]);

        let top = t.narrow_rows(0, 1).unwrap();
        let back = Tensor::cat_rows(&[top, rows]).unwrap();
        assert_eq!(back, t);

        let left = t.narrow_cols(0, 1).unwrap();
        let back = Tensor::cat_cols(&[left, cols]).unwrap();
        assert_eq!(back, t);

        assert!(matches!(
            t.narrow_rows(2, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_sum_rows_and_bias() {
        let t = t2(&[1.0, 2.0, 3.0, 4.0], [2, 2]);
        assert_eq!(t.sum_rows().data(), &[4.0, 6.0]);

        let bias = Tensor::<f32, 1>::new(vec![10.0, 20.0], [2]).unwrap();
        let out = t.add_row_vector(&bias).unwrap();
        assert_eq!(out.data(), &[11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_allclose_and_max_abs_diff() {
        let reference = Tensor::<f32, 1>::new(vec![1.0, 100.0], [2]).unwrap();
        let close = Tensor::<f32, 1>::new(vec![1.001, 100.2], [2]).unwrap();

        // 0.2 <= 0.01 + 3e-3 * 100
        assert!(close.allclose(&reference, 3e-3, 1e-2).unwrap());
        assert!(!close.allclose(&reference, 0.0, 1e-2).unwrap());

        let diff = close.max_abs_diff(&reference).unwrap();
        assert!((diff - 0.2).abs() < 1e-4);
    }

    #[test]
    fn test_allclose_rejects_nan() {
        let reference = Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap();
        let nan = Tensor::<f32, 1>::new(vec![f32::NAN], [1]).unwrap();
        assert!(!nan.allclose(&reference, 1.0, 1.0).unwrap());
    }
}
