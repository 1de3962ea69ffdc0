use crate::{require_rank, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU matrix multiplication `A · B`.
///
/// Shapes are `[..., M, K]` and `[..., K, N]`; leading dimensions are batch dimensions and must
/// match. Accumulation happens in `T`, so callers that want fp32 accumulation pass `f32` data.
///
/// The right-hand side is transposed once so every output element is a dot product of two
/// contiguous rows, then rows of the output are distributed over the rayon pool.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    require_rank::<RANK>(2)?;
    let k = lhs_shape[RANK - 1];
    if k != rhs_shape[RANK - 2] || lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }

    // rhs is [..., K, N], we want [..., N, K]
    let rhs_t_data = super::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;
    let mut rhs_t_shape = *rhs_shape;
    rhs_t_shape.swap(RANK - 1, RANK - 2);

    cpu_matmul_nt(lhs_data, &rhs_t_data, lhs_shape, &rhs_t_shape)
}

/// CPU matrix multiplication against a transposed right-hand side: `A · Bᵀ`.
///
/// Shapes are `[..., M, K]` and `[..., N, K]`. This is the natural layout for a linear layer
/// whose weight is stored `[out_features, in_features]`: both operands are walked row by row.
pub fn cpu_matmul_nt<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    require_rank::<RANK>(2)?;
    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 2];

    if k != rhs_shape[RANK - 1] || lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }
    let lhs_len: usize = lhs_shape.iter().product();
    let rhs_len: usize = rhs_shape.iter().product();
    if lhs_data.len() != lhs_len || rhs_data.len() != rhs_len {
        return Err(KernelError::ShapeMismatch {
            expected: vec![lhs_len, rhs_len],
            got: vec![lhs_data.len(), rhs_data.len()],
        });
    }

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if n == 0 {
        return Ok(out_data);
    }

    out_data
        .as_mut_slice()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(global_row_idx, out_row)| {
            let batch_idx = global_row_idx / m.max(1);
            let row_in_matrix = global_row_idx % m.max(1);

            let a_row_start = batch_idx * m * k + row_in_matrix * k;
            let a_slice = &lhs_data[a_row_start..a_row_start + k];
            let b_batch_offset = batch_idx * n * k;

            for (col, out_elem) in out_row.iter_mut().enumerate() {
                let b_row_start = b_batch_offset + col * k;
                let b_slice = &rhs_data[b_row_start..b_row_start + k];

                let mut sum = T::zero();
                for (&val_a, &val_b) in a_slice.iter().zip(b_slice.iter()) {
                    sum += val_a * val_b;
                }
                *out_elem = sum;
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelError;

    #[test]
    fn test_matmul_simple() {
        let a = vec![1.0, 2.0, 3.0, 4.0]; // 2x2
        let b = vec![5.0, 6.0, 7.0, 8.0]; // 2x2

        let result = cpu_matmul(&a, &b, &[2, 2], &[2, 2]).unwrap();
        // [1*5+2*7, 1*6+2*8] = [19, 22]
        // [3*5+4*7, 3*6+4*8] = [43, 50]
        assert_eq!(result, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_batch() {
        let a = vec![
            1.0, 0.0, 0.0, 1.0, // Identity
            2.0, 0.0, 0.0, 2.0, // Scaled Identity
        ];
        let b = vec![
            1.0, 2.0, 3.0, 4.0, //
            5.0, 6.0, 7.0, 8.0, //
        ];

        let result = cpu_matmul(&a, &b, &[2, 2, 2], &[2, 2, 2]).unwrap();
        let expected = vec![1.0, 2.0, 3.0, 4.0, 10.0, 12.0, 14.0, 16.0];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_matmul_nt_matches_matmul() {
        // A: [2, 3], W: [4, 3] stored as [out, in]
        let a: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let w: Vec<f32> = (0..12).map(|i| (i as f32) * 0.5 - 2.0).collect();

        let nt = cpu_matmul_nt(&a, &w, &[2, 3], &[4, 3]).unwrap();
        let w_t = crate::cpu_transpose(&w, &[4, 3]).unwrap();
        let nn = cpu_matmul(&a, &w_t, &[2, 3], &[3, 4]).unwrap();
        assert_eq!(nt, nn);
    }

    #[test]
    fn test_matmul_shape_mismatch() {
        let a = vec![1.0; 4]; // 2x2
        let b = vec![1.0; 6]; // 3x2

        let err = cpu_matmul(&a, &b, &[2, 2], &[3, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matmul_rank_too_low() {
        let a = vec![1.0f32; 2];
        let err = cpu_matmul_nt(&a, &a, &[2], &[2]);
        assert_eq!(
            err,
            Err(KernelError::RankTooLow {
                required: 2,
                got: 1
            })
        );
    }
}
