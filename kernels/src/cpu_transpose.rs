use crate::{require_rank, KernelElem, KernelError, Result};
use rayon::prelude::*;

/// CPU transpose of the last two dimensions.
///
/// `[..., M, N]` becomes `[..., N, M]`. Output rows are filled in parallel; each output row is a
/// strided column of the input.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    require_rank::<RANK>(2)?;
    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }

    let mut out_data = vec![T::zero(); size];
    if m == 0 {
        return Ok(out_data);
    }

    // Output viewed as [Batch * N, M].
    out_data
        .as_mut_slice()
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(i, out_row)| {
            let batch_idx = i / n;
            let col_idx = i % n;
            let input_batch_offset = batch_idx * m * n;

            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[input_batch_offset + r * n + col_idx];
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_simple() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3

        let result = cpu_transpose(&data, &[2, 3]).unwrap();
        // [1, 4]
        // [2, 5]
        // [3, 6]
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_batch() {
        let data = vec![
            1.0, 2.0, 3.0, 4.0, // Matrix 1
            5.0, 6.0, 7.0, 8.0, // Matrix 2
        ];

        let result = cpu_transpose(&data, &[2, 2, 2]).unwrap();
        let expected = vec![1.0, 3.0, 2.0, 4.0, 5.0, 7.0, 6.0, 8.0];
        assert_eq!(result, expected);
    }

    #[test]
    fn test_transpose_length_mismatch() {
        let data = vec![1.0f32; 5];
        let err = cpu_transpose(&data, &[2, 3]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
