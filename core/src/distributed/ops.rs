//! Moving activations in and out of the sequence-parallel region.
//!
//! Inside the region every rank holds `rows / world_size` consecutive rows of a
//! `[batch * seqlen, features]` activation. Rank `r` owns rows `[r * n, (r + 1) * n)`.

use super::backend::CollectiveBackend;
use crate::error::Result;
use crate::tensor::Tensor;

/// Keeps this rank's slice of the rows. No communication.
pub fn scatter_to_sequence_parallel_region(
    x: &Tensor<f32, 2>,
    rank: usize,
    world_size: usize,
) -> Result<Tensor<f32, 2>> {
    crate::ensure!(
        world_size > 0 && x.rows() % world_size == 0,
        "{} rows cannot be split over {world_size} ranks",
        x.rows()
    );
    let rows = x.rows() / world_size;
    Ok(x.narrow_rows(rank * rows, rows)?)
}

/// Concatenates the row slices of every rank.
pub fn gather_from_sequence_parallel_region(
    x: &Tensor<f32, 2>,
    group: &dyn CollectiveBackend,
) -> Result<Tensor<f32, 2>> {
    if group.world_size() == 1 {
        return Ok(x.clone());
    }
    let data = group.all_gather(x.data())?;
    Ok(Tensor::new(data, [x.rows() * group.world_size(), x.cols()])?)
}

/// Sums full-length partial results over the group and keeps this rank's row slice.
///
/// Rows that do not split evenly fail here, before the collective is entered.
pub fn reduce_scatter_to_sequence_parallel_region(
    x: &Tensor<f32, 2>,
    group: &dyn CollectiveBackend,
) -> Result<Tensor<f32, 2>> {
    let world_size = group.world_size();
    crate::ensure!(
        x.rows() % world_size == 0,
        "{} rows cannot be split over {world_size} ranks",
        x.rows()
    );
    if world_size == 1 {
        return Ok(x.clone());
    }
    let data = group.reduce_scatter(x.data())?;
    Ok(Tensor::new(data, [x.rows() / world_size, x.cols()])?)
}

/// In-place sum over the group.
pub fn all_reduce_tensor<const RANK: usize>(
    x: &mut Tensor<f32, RANK>,
    group: &dyn CollectiveBackend,
) -> Result<()> {
    group.all_reduce_sum(x.data_mut())
}
